//! Occlusion queries.

use std::sync::Arc;

use ash::vk;

use crate::context::GpuContext;
use crate::deferred::Garbage;
use crate::error::Result;

/// A single occlusion query. Command buffers reset it before every begin.
pub struct OcclusionQuery {
    ctx: Arc<GpuContext>,
    pool: vk::QueryPool,
}

impl OcclusionQuery {
    pub fn new(ctx: Arc<GpuContext>) -> Result<Self> {
        let create_info = vk::QueryPoolCreateInfo::default()
            .query_type(vk::QueryType::OCCLUSION)
            .query_count(1);
        let pool = unsafe { ctx.device().create_query_pool(&create_info, None)? };
        Ok(Self { ctx, pool })
    }

    pub fn pool(&self) -> vk::QueryPool {
        self.pool
    }

    /// Whether the device counts exact samples rather than a boolean.
    pub fn is_precise(&self) -> bool {
        self.ctx.capabilities().supports_occlusion_query_precise
    }

    /// Number of samples that passed, or `None` while the query is pending.
    pub fn result(&self) -> Result<Option<u64>> {
        // Value followed by the availability word.
        let mut data = [[0u64; 2]; 1];
        let status = unsafe {
            self.ctx.device().get_query_pool_results(
                self.pool,
                0,
                &mut data,
                vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WITH_AVAILABILITY,
            )
        };
        match status {
            Ok(()) => Ok(availability(data[0])),
            Err(vk::Result::NOT_READY) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn availability([value, available]: [u64; 2]) -> Option<u64> {
    (available != 0).then_some(value)
}

impl Drop for OcclusionQuery {
    fn drop(&mut self) {
        self.ctx.defer_destroy(Garbage::QueryPool(self.pool));
    }
}

impl std::fmt::Debug for OcclusionQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("OcclusionQuery").field(&self.pool).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_results_are_pending() {
        assert_eq!(availability([42, 0]), None);
        assert_eq!(availability([42, 1]), Some(42));
        assert_eq!(availability([0, 1]), Some(0));
    }
}
