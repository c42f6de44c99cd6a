//! Fixed-function state enums and their Vulkan counterparts.

use ash::vk;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CompareOperation {
    #[default]
    Always,
    Less,
    Equal,
    LessEqual,
    Greater,
    GreaterEqual,
    NotEqual,
    Never,
}

impl From<CompareOperation> for vk::CompareOp {
    fn from(op: CompareOperation) -> Self {
        match op {
            CompareOperation::Always => vk::CompareOp::ALWAYS,
            CompareOperation::Less => vk::CompareOp::LESS,
            CompareOperation::Equal => vk::CompareOp::EQUAL,
            CompareOperation::LessEqual => vk::CompareOp::LESS_OR_EQUAL,
            CompareOperation::Greater => vk::CompareOp::GREATER,
            CompareOperation::GreaterEqual => vk::CompareOp::GREATER_OR_EQUAL,
            CompareOperation::NotEqual => vk::CompareOp::NOT_EQUAL,
            CompareOperation::Never => vk::CompareOp::NEVER,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PrimitiveTopology {
    Points,
    Lines,
    LineStrip,
    #[default]
    Triangles,
    TriangleStrip,
    Patches,
}

impl From<PrimitiveTopology> for vk::PrimitiveTopology {
    fn from(topology: PrimitiveTopology) -> Self {
        match topology {
            PrimitiveTopology::Points => vk::PrimitiveTopology::POINT_LIST,
            PrimitiveTopology::Lines => vk::PrimitiveTopology::LINE_LIST,
            PrimitiveTopology::LineStrip => vk::PrimitiveTopology::LINE_STRIP,
            PrimitiveTopology::Triangles => vk::PrimitiveTopology::TRIANGLE_LIST,
            PrimitiveTopology::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
            PrimitiveTopology::Patches => vk::PrimitiveTopology::PATCH_LIST,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum FillMode {
    Points,
    Wireframe,
    #[default]
    Solid,
}

impl From<FillMode> for vk::PolygonMode {
    fn from(mode: FillMode) -> Self {
        match mode {
            FillMode::Points => vk::PolygonMode::POINT,
            FillMode::Wireframe => vk::PolygonMode::LINE,
            FillMode::Solid => vk::PolygonMode::FILL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CullMode {
    Front,
    #[default]
    Back,
    FrontAndBack,
}

impl From<CullMode> for vk::CullModeFlags {
    fn from(mode: CullMode) -> Self {
        match mode {
            CullMode::Front => vk::CullModeFlags::FRONT,
            CullMode::Back => vk::CullModeFlags::BACK,
            CullMode::FrontAndBack => vk::CullModeFlags::FRONT_AND_BACK,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlendMethod {
    Zero,
    One,
    SrcColor,
    OneMinusSrcColor,
    DstColor,
    OneMinusDstColor,
    SrcAlpha,
    OneMinusSrcAlpha,
    DstAlpha,
    OneMinusDstAlpha,
    ConstantColor,
    OneMinusConstantColor,
    ConstantAlpha,
    OneMinusConstantAlpha,
    SrcAlphaSaturate,
    Src1Color,
    OneMinusSrc1Color,
    Src1Alpha,
    OneMinusSrc1Alpha,
}

impl From<BlendMethod> for vk::BlendFactor {
    fn from(method: BlendMethod) -> Self {
        match method {
            BlendMethod::Zero => vk::BlendFactor::ZERO,
            BlendMethod::One => vk::BlendFactor::ONE,
            BlendMethod::SrcColor => vk::BlendFactor::SRC_COLOR,
            BlendMethod::OneMinusSrcColor => vk::BlendFactor::ONE_MINUS_SRC_COLOR,
            BlendMethod::DstColor => vk::BlendFactor::DST_COLOR,
            BlendMethod::OneMinusDstColor => vk::BlendFactor::ONE_MINUS_DST_COLOR,
            BlendMethod::SrcAlpha => vk::BlendFactor::SRC_ALPHA,
            BlendMethod::OneMinusSrcAlpha => vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            BlendMethod::DstAlpha => vk::BlendFactor::DST_ALPHA,
            BlendMethod::OneMinusDstAlpha => vk::BlendFactor::ONE_MINUS_DST_ALPHA,
            BlendMethod::ConstantColor => vk::BlendFactor::CONSTANT_COLOR,
            BlendMethod::OneMinusConstantColor => vk::BlendFactor::ONE_MINUS_CONSTANT_COLOR,
            BlendMethod::ConstantAlpha => vk::BlendFactor::CONSTANT_ALPHA,
            BlendMethod::OneMinusConstantAlpha => vk::BlendFactor::ONE_MINUS_CONSTANT_ALPHA,
            BlendMethod::SrcAlphaSaturate => vk::BlendFactor::SRC_ALPHA_SATURATE,
            BlendMethod::Src1Color => vk::BlendFactor::SRC1_COLOR,
            BlendMethod::OneMinusSrc1Color => vk::BlendFactor::ONE_MINUS_SRC1_COLOR,
            BlendMethod::Src1Alpha => vk::BlendFactor::SRC1_ALPHA,
            BlendMethod::OneMinusSrc1Alpha => vk::BlendFactor::ONE_MINUS_SRC1_ALPHA,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BlendFunction {
    #[default]
    Add,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
}

impl From<BlendFunction> for vk::BlendOp {
    fn from(function: BlendFunction) -> Self {
        match function {
            BlendFunction::Add => vk::BlendOp::ADD,
            BlendFunction::Subtract => vk::BlendOp::SUBTRACT,
            BlendFunction::ReverseSubtract => vk::BlendOp::REVERSE_SUBTRACT,
            BlendFunction::Min => vk::BlendOp::MIN,
            BlendFunction::Max => vk::BlendOp::MAX,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AttachmentLoadOperation {
    Load,
    Clear,
    #[default]
    DontCare,
}

impl From<AttachmentLoadOperation> for vk::AttachmentLoadOp {
    fn from(op: AttachmentLoadOperation) -> Self {
        match op {
            AttachmentLoadOperation::Load => vk::AttachmentLoadOp::LOAD,
            AttachmentLoadOperation::Clear => vk::AttachmentLoadOp::CLEAR,
            AttachmentLoadOperation::DontCare => vk::AttachmentLoadOp::DONT_CARE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AttachmentStoreOperation {
    #[default]
    Store,
    DontCare,
}

impl From<AttachmentStoreOperation> for vk::AttachmentStoreOp {
    fn from(op: AttachmentStoreOperation) -> Self {
        match op {
            AttachmentStoreOperation::Store => vk::AttachmentStoreOp::STORE,
            AttachmentStoreOperation::DontCare => vk::AttachmentStoreOp::DONT_CARE,
        }
    }
}

/// Texel and mip filtering. `Base` only applies to mip filtering and samples level 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SamplingFilter {
    Nearest,
    Linear,
    Base,
}

impl SamplingFilter {
    pub fn to_vk_filter(self) -> vk::Filter {
        match self {
            SamplingFilter::Nearest | SamplingFilter::Base => vk::Filter::NEAREST,
            SamplingFilter::Linear => vk::Filter::LINEAR,
        }
    }

    pub fn to_vk_mipmap_mode(self) -> vk::SamplerMipmapMode {
        match self {
            SamplingFilter::Nearest | SamplingFilter::Base => vk::SamplerMipmapMode::NEAREST,
            SamplingFilter::Linear => vk::SamplerMipmapMode::LINEAR,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TextureType {
    Texture1D,
    #[default]
    Texture2D,
    Texture3D,
    Texture2DArray,
    Cube,
    CubeArray,
}

impl TextureType {
    pub fn to_vk_image_type(self) -> vk::ImageType {
        match self {
            TextureType::Cube
            | TextureType::CubeArray
            | TextureType::Texture2D
            | TextureType::Texture2DArray => vk::ImageType::TYPE_2D,
            TextureType::Texture3D => vk::ImageType::TYPE_3D,
            TextureType::Texture1D => vk::ImageType::TYPE_1D,
        }
    }

    pub fn to_vk_view_type(self) -> vk::ImageViewType {
        match self {
            TextureType::Texture1D => vk::ImageViewType::TYPE_1D,
            TextureType::Texture2D => vk::ImageViewType::TYPE_2D,
            TextureType::Texture2DArray => vk::ImageViewType::TYPE_2D_ARRAY,
            TextureType::Texture3D => vk::ImageViewType::TYPE_3D,
            TextureType::Cube => vk::ImageViewType::CUBE,
            TextureType::CubeArray => vk::ImageViewType::CUBE_ARRAY,
        }
    }

    pub fn is_cube(self) -> bool {
        matches!(self, TextureType::Cube | TextureType::CubeArray)
    }

    pub fn is_array(self) -> bool {
        matches!(self, TextureType::Texture2DArray | TextureType::CubeArray)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexType {
    U16,
    U32,
}

impl From<IndexType> for vk::IndexType {
    fn from(index_type: IndexType) -> Self {
        match index_type {
            IndexType::U16 => vk::IndexType::UINT16,
            IndexType::U32 => vk::IndexType::UINT32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn texture_types_map_to_images_and_views() {
        assert_eq!(
            TextureType::CubeArray.to_vk_image_type(),
            vk::ImageType::TYPE_2D
        );
        assert_eq!(
            TextureType::CubeArray.to_vk_view_type(),
            vk::ImageViewType::CUBE_ARRAY
        );
        assert_eq!(
            TextureType::Texture3D.to_vk_image_type(),
            vk::ImageType::TYPE_3D
        );
        assert!(TextureType::Cube.is_cube());
        assert!(!TextureType::Cube.is_array());
    }

    #[test]
    fn fixed_function_conversions() {
        assert_eq!(
            vk::CompareOp::from(CompareOperation::LessEqual),
            vk::CompareOp::LESS_OR_EQUAL
        );
        assert_eq!(
            vk::PrimitiveTopology::from(PrimitiveTopology::LineStrip),
            vk::PrimitiveTopology::LINE_STRIP
        );
        assert_eq!(
            vk::CullModeFlags::from(CullMode::FrontAndBack),
            vk::CullModeFlags::FRONT_AND_BACK
        );
        assert_eq!(
            vk::BlendFactor::from(BlendMethod::OneMinusSrc1Alpha),
            vk::BlendFactor::ONE_MINUS_SRC1_ALPHA
        );
        assert_eq!(vk::PolygonMode::from(FillMode::Wireframe), vk::PolygonMode::LINE);
        assert_eq!(
            vk::AttachmentLoadOp::from(AttachmentLoadOperation::Clear),
            vk::AttachmentLoadOp::CLEAR
        );
        assert_eq!(
            SamplingFilter::Base.to_vk_mipmap_mode(),
            vk::SamplerMipmapMode::NEAREST
        );
    }
}
