/// Opaque handle to a device resource. Zero is never handed out.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct Rid(pub(crate) u64);

impl Rid {
    pub const INVALID: Rid = Rid(0);

    pub fn is_invalid(self) -> bool {
        self.0 == 0
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum TextureFormat {
    R8Unorm,
    R32Float,
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Bgra8UnormSrgb,
    Rgba16Float,
    Depth32Float,
}

impl TextureFormat {
    pub fn is_depth(self) -> bool {
        matches!(self, Self::Depth32Float)
    }

    pub fn bytes_per_texel(self) -> u32 {
        match self {
            Self::R8Unorm => 1,
            Self::R32Float | Self::Rgba8Unorm | Self::Rgba8UnormSrgb | Self::Bgra8UnormSrgb => 4,
            Self::Rgba16Float => 8,
            Self::Depth32Float => 4,
        }
    }

    pub(super) fn label(self) -> &'static str {
        match self {
            Self::R8Unorm => "r8unorm",
            Self::R32Float => "r32float",
            Self::Rgba8Unorm => "rgba8unorm",
            Self::Rgba8UnormSrgb => "rgba8unorm-srgb",
            Self::Bgra8UnormSrgb => "bgra8unorm-srgb",
            Self::Rgba16Float => "rgba16float",
            Self::Depth32Float => "depth32float",
        }
    }
}

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
    pub struct TextureUsage: u32 {
        const SAMPLING = 1 << 0;
        const STORAGE = 1 << 1;
        const COLOR_ATTACHMENT = 1 << 2;
        const DEPTH_ATTACHMENT = 1 << 3;
        const CAN_UPDATE = 1 << 4;
        const CAN_COPY_FROM = 1 << 5;
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub mipmaps: u32,
    pub format: TextureFormat,
    pub usage: TextureUsage,
}

impl TextureDesc {
    pub fn new_2d(width: u32, height: u32, format: TextureFormat, usage: TextureUsage) -> Self {
        Self {
            width,
            height,
            mipmaps: 1,
            format,
            usage,
        }
    }

    pub fn with_mipmaps(mut self, mipmaps: u32) -> Self {
        self.mipmaps = mipmaps;
        self
    }

    pub fn mip_size(&self, mip: u32) -> (u32, u32) {
        ((self.width >> mip).max(1), (self.height >> mip).max(1))
    }

    pub fn mip_bytes(&self, mip: u32) -> usize {
        let (w, h) = self.mip_size(mip);
        (w * h * self.format.bytes_per_texel()) as usize
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BufferKind {
    Vertex,
    Index,
    Uniform,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum VertexFormat {
    Float32x2,
    Float32x3,
}

impl VertexFormat {
    pub fn size(self) -> u64 {
        match self {
            Self::Float32x2 => 8,
            Self::Float32x3 => 12,
        }
    }
}

/// One attribute, read from the vertex array buffer at the same position as
/// `location`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct VertexAttribute {
    pub location: u32,
    pub format: VertexFormat,
}

pub const POSITION_NORMAL_UV: [VertexAttribute; 3] = [
    VertexAttribute {
        location: 0,
        format: VertexFormat::Float32x3,
    },
    VertexAttribute {
        location: 1,
        format: VertexFormat::Float32x3,
    },
    VertexAttribute {
        location: 2,
        format: VertexFormat::Float32x2,
    },
];

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BindingKind {
    UniformBuffer,
    /// Float texture read with `textureLoad`.
    Texture,
    DepthTexture,
    StorageTexture(TextureFormat),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BindingDecl {
    pub binding: u32,
    pub kind: BindingKind,
}

impl BindingDecl {
    pub const fn new(binding: u32, kind: BindingKind) -> Self {
        Self { binding, kind }
    }
}

/// Stage sources. Entry points are fixed by convention: `tess_eval` and
/// `fragment_main` for tessellated shaders, `vertex_main` and
/// `fragment_main` for raster shaders, `compute_main` for compute.
#[derive(Clone, Debug, PartialEq)]
pub enum ShaderSource {
    Tessellated {
        vertex: String,
        tess_control: String,
        tess_eval: String,
        fragment: String,
    },
    Raster {
        vertex: String,
        fragment: Option<String>,
    },
    Compute {
        compute: String,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct ShaderDesc {
    pub label: String,
    pub source: ShaderSource,
    /// Set 0 layout.
    pub bindings: Vec<BindingDecl>,
}

impl ShaderDesc {
    pub fn is_tessellated(&self) -> bool {
        matches!(self.source, ShaderSource::Tessellated { .. })
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Uniform {
    Buffer { binding: u32, buffer: Rid },
    Texture { binding: u32, texture: Rid },
    StorageTexture { binding: u32, texture: Rid },
}

impl Uniform {
    pub fn binding(&self) -> u32 {
        match *self {
            Self::Buffer { binding, .. }
            | Self::Texture { binding, .. }
            | Self::StorageTexture { binding, .. } => binding,
        }
    }

    pub fn resource(&self) -> Rid {
        match *self {
            Self::Buffer { buffer, .. } => buffer,
            Self::Texture { texture, .. } | Self::StorageTexture { texture, .. } => texture,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Primitive {
    Triangles,
    /// Indexed triangle patches tessellated up to `max_level` subdivisions
    /// per edge.
    Patches { control_points: u32, max_level: u32 },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CullMode {
    None,
    Front,
    Back,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CompareOp {
    Less,
    LessOrEqual,
    Always,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BlendMode {
    Replace,
    Alpha,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PipelineState {
    pub primitive: Primitive,
    pub cull: CullMode,
    pub depth_test: Option<CompareOp>,
    pub depth_write: bool,
    pub blend: BlendMode,
}

impl Default for PipelineState {
    fn default() -> Self {
        Self {
            primitive: Primitive::Triangles,
            cull: CullMode::None,
            depth_test: Some(CompareOp::Less),
            depth_write: true,
            blend: BlendMode::Replace,
        }
    }
}

/// `None` loads the existing attachment contents.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct ClearValues {
    pub color: Option<[f64; 4]>,
    pub depth: Option<f32>,
}

impl ClearValues {
    pub fn all(color: [f64; 4], depth: f32) -> Self {
        Self {
            color: Some(color),
            depth: Some(depth),
        }
    }

    pub fn load() -> Self {
        Self::default()
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct DrawListId(pub(crate) u64);

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct ComputeListId(pub(crate) u64);
