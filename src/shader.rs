// Shaders - compiled SPIR-V plus the reflection the binder needs
//
// Shaders are compiled offline (build.rs runs glslc). Next to each shader
// lives a `<name>.shader.toml` manifest naming the SPIR-V file of every
// stage and declaring what that stage reads: descriptor bindings, push
// constants and vertex inputs.
//
// A `Shader` is shared by every pipeline that uses it. Reloading swaps the
// compiled contents in place and bumps the generation; pipelines rebuild
// their objects when told about the change.

use anyhow::{bail, Context, Result};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;

use crate::backend::{DescriptorKind, ShaderStages, VertexFormat};

const SPIRV_MAGIC: u32 = 0x0723_0203;
const MANIFEST_SUFFIX: &str = ".shader.toml";

// =============================================================================
// REFLECTION TABLE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Vertex,
    Fragment,
}

impl Stage {
    pub fn mask(self) -> ShaderStages {
        match self {
            Stage::Vertex => ShaderStages::VERTEX,
            Stage::Fragment => ShaderStages::FRAGMENT,
        }
    }
}

/// Resource types as a shader declares them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    UniformBuffer,
    StorageBuffer,
    /// `sampler2D`: image and sampler in one binding
    SampledImage,
    /// `texture2D`: image without a sampler
    Image,
    Sampler,
    StorageImage,
}

impl ResourceKind {
    pub fn descriptor_kind(self) -> DescriptorKind {
        match self {
            ResourceKind::UniformBuffer => DescriptorKind::UniformBuffer,
            ResourceKind::StorageBuffer => DescriptorKind::StorageBuffer,
            ResourceKind::SampledImage => DescriptorKind::CombinedImageSampler,
            ResourceKind::Image => DescriptorKind::SampledImage,
            ResourceKind::Sampler => DescriptorKind::Sampler,
            ResourceKind::StorageImage => DescriptorKind::StorageImage,
        }
    }
}

fn one() -> u32 {
    1
}

fn main_entry() -> String {
    "main".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReflectedResource {
    pub name: String,
    #[serde(default)]
    pub set: u32,
    pub binding: u32,
    pub kind: ResourceKind,
    /// Array length; 1 for a plain binding
    #[serde(default = "one")]
    pub count: u32,
    /// Block size in bytes for buffers
    #[serde(default)]
    pub size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReflectedPushConstant {
    #[serde(default)]
    pub offset: u32,
    pub size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReflectedInput {
    pub name: String,
    pub location: u32,
    pub format: VertexFormat,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageReflection {
    #[serde(default)]
    pub resources: Vec<ReflectedResource>,
    #[serde(default)]
    pub push_constants: Vec<ReflectedPushConstant>,
    #[serde(default)]
    pub inputs: Vec<ReflectedInput>,
}

#[derive(Debug, Clone)]
pub struct CompiledStage {
    pub stage: Stage,
    pub words: Vec<u32>,
    pub entry_point: String,
    pub reflection: StageReflection,
}

#[derive(Debug, Clone, Default)]
pub struct CompiledShader {
    pub stages: Vec<CompiledStage>,
}

impl CompiledShader {
    pub fn stage(&self, stage: Stage) -> Option<&CompiledStage> {
        self.stages.iter().find(|s| s.stage == stage)
    }

    /// Sets declared by any stage
    pub fn declared_sets(&self) -> BTreeSet<u32> {
        self.stages
            .iter()
            .flat_map(|s| s.reflection.resources.iter().map(|r| r.set))
            .collect()
    }
}

// =============================================================================
// SHADER
// =============================================================================

pub struct Shader {
    name: String,
    compiled: RwLock<Arc<CompiledShader>>,
    generation: AtomicU64,
}

impl std::fmt::Debug for Shader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shader")
            .field("name", &self.name)
            .field("stages", &self.compiled.read().stages.len())
            .field("generation", &self.generation())
            .finish()
    }
}

impl Shader {
    pub fn new(name: impl Into<String>, compiled: CompiledShader) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            compiled: RwLock::new(Arc::new(compiled)),
            generation: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Snapshot of the current contents
    pub fn compiled(&self) -> Arc<CompiledShader> {
        self.compiled.read().clone()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn replace(&self, compiled: CompiledShader) {
        *self.compiled.write() = Arc::new(compiled);
        self.generation.fetch_add(1, Ordering::AcqRel);
    }
}

// =============================================================================
// SOURCES
// =============================================================================

/// Where compiled shaders come from
pub trait ShaderSource: Send + Sync {
    fn load(&self, name: &str) -> Result<CompiledShader>;

    /// Directory to watch for changes, if the source lives on disk
    fn watch_directory(&self) -> Option<&Path> {
        None
    }
}

#[derive(Debug, Deserialize)]
struct ShaderManifest {
    #[serde(rename = "stage", default)]
    stages: Vec<ManifestStage>,
}

#[derive(Debug, Deserialize)]
struct ManifestStage {
    stage: Stage,
    spirv: PathBuf,
    #[serde(default = "main_entry")]
    entry_point: String,
    #[serde(default)]
    resources: Vec<ReflectedResource>,
    #[serde(default)]
    push_constants: Vec<ReflectedPushConstant>,
    #[serde(default)]
    inputs: Vec<ReflectedInput>,
}

/// Reads `<directory>/<name>.shader.toml` and the SPIR-V files it names
#[derive(Debug, Clone)]
pub struct ManifestShaderSource {
    directory: PathBuf,
}

impl ManifestShaderSource {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn manifest_path(&self, name: &str) -> PathBuf {
        self.directory.join(format!("{}{}", name, MANIFEST_SUFFIX))
    }
}

/// Decode little-endian SPIR-V words and check the magic number
pub fn spirv_words(bytes: &[u8]) -> Result<Vec<u32>> {
    if bytes.len() % 4 != 0 || bytes.is_empty() {
        bail!("SPIR-V length {} is not a non-zero multiple of 4", bytes.len());
    }
    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    if words[0] != SPIRV_MAGIC {
        bail!("Bad SPIR-V magic number {:#010x}", words[0]);
    }
    Ok(words)
}

impl ShaderSource for ManifestShaderSource {
    fn load(&self, name: &str) -> Result<CompiledShader> {
        let path = self.manifest_path(name);
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read shader manifest {}", path.display()))?;
        let manifest: ShaderManifest = toml::from_str(&content)
            .with_context(|| format!("Failed to parse shader manifest {}", path.display()))?;

        if manifest.stages.is_empty() {
            bail!("Shader manifest {} declares no stages", path.display());
        }

        let mut stages = Vec::with_capacity(manifest.stages.len());
        for stage in manifest.stages {
            let spirv_path = self.directory.join(&stage.spirv);
            let bytes = std::fs::read(&spirv_path)
                .with_context(|| format!("Failed to read SPIR-V {}", spirv_path.display()))?;
            let words = spirv_words(&bytes).with_context(|| format!("Invalid SPIR-V {}", spirv_path.display()))?;
            stages.push(CompiledStage {
                stage: stage.stage,
                words,
                entry_point: stage.entry_point,
                reflection: StageReflection {
                    resources: stage.resources,
                    push_constants: stage.push_constants,
                    inputs: stage.inputs,
                },
            });
        }

        log::debug!("Loaded shader '{}' ({} stages)", name, stages.len());
        Ok(CompiledShader { stages })
    }

    fn watch_directory(&self) -> Option<&Path> {
        Some(&self.directory)
    }
}

/// Shaders registered by name, for tests and tools without a shader directory
#[derive(Default)]
pub struct InMemoryShaderSource {
    shaders: Mutex<HashMap<String, CompiledShader>>,
}

impl InMemoryShaderSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: impl Into<String>, shader: CompiledShader) {
        self.shaders.lock().insert(name.into(), shader);
    }
}

impl ShaderSource for InMemoryShaderSource {
    fn load(&self, name: &str) -> Result<CompiledShader> {
        self.shaders
            .lock()
            .get(name)
            .cloned()
            .with_context(|| format!("Unknown shader '{}'", name))
    }
}

impl<S: ShaderSource + ?Sized> ShaderSource for Arc<S> {
    fn load(&self, name: &str) -> Result<CompiledShader> {
        (**self).load(name)
    }

    fn watch_directory(&self) -> Option<&Path> {
        (**self).watch_directory()
    }
}

// =============================================================================
// LIBRARY
// =============================================================================

/// Loaded shaders by name; each name maps to one shared `Shader`
pub struct ShaderLibrary {
    source: Box<dyn ShaderSource>,
    shaders: Mutex<HashMap<String, Arc<Shader>>>,
}

impl ShaderLibrary {
    pub fn new(source: Box<dyn ShaderSource>) -> Self {
        Self {
            source,
            shaders: Mutex::new(HashMap::new()),
        }
    }

    pub fn source(&self) -> &dyn ShaderSource {
        self.source.as_ref()
    }

    /// Load on first use, then hand out the same `Shader`
    pub fn get(&self, name: &str) -> Result<Arc<Shader>> {
        if let Some(shader) = self.shaders.lock().get(name) {
            return Ok(shader.clone());
        }
        let compiled = self.source.load(name)?;
        let mut shaders = self.shaders.lock();
        let shader = shaders
            .entry(name.to_string())
            .or_insert_with(|| Shader::new(name, compiled))
            .clone();
        Ok(shader)
    }

    /// Reload `name` from the source, replacing its contents in place.
    /// Returns `None` if the shader was never loaded.
    pub fn reload(&self, name: &str) -> Result<Option<Arc<Shader>>> {
        let Some(shader) = self.shaders.lock().get(name).cloned() else {
            return Ok(None);
        };
        let compiled = self
            .source
            .load(name)
            .with_context(|| format!("Failed to reload shader '{}'", name))?;
        shader.replace(compiled);
        log::info!("Reloaded shader '{}' (generation {})", name, shader.generation());
        Ok(Some(shader))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shaders.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

// =============================================================================
// WATCHER
// =============================================================================

/// Watches the shader directory and reports which shaders changed
pub struct ShaderWatcher {
    _watcher: RecommendedWatcher,
    events: Receiver<notify::Result<notify::Event>>,
}

impl ShaderWatcher {
    pub fn new(directory: &Path) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let mut watcher = notify::recommended_watcher(move |event| {
            // Receiver gone means the context is shutting down
            let _ = tx.send(event);
        })
        .context("Failed to create shader watcher")?;
        watcher
            .watch(directory, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch {}", directory.display()))?;
        log::info!("Watching {} for shader changes", directory.display());
        Ok(Self {
            _watcher: watcher,
            events: rx,
        })
    }

    /// Shader names whose manifest or SPIR-V changed since the last poll
    pub fn poll_changed(&self) -> Vec<String> {
        let mut changed = BTreeSet::new();
        while let Ok(event) = self.events.try_recv() {
            match event {
                Ok(event) => {
                    if !(event.kind.is_modify() || event.kind.is_create()) {
                        continue;
                    }
                    for path in &event.paths {
                        if let Some(name) = shader_name_for(path) {
                            changed.insert(name);
                        }
                    }
                }
                Err(e) => log::warn!("Shader watcher error: {}", e),
            }
        }
        changed.into_iter().collect()
    }
}

/// `triangle.shader.toml`, `triangle.vert.spv` and `triangle.frag` all map to `triangle`
pub fn shader_name_for(path: &Path) -> Option<String> {
    let file = path.file_name()?.to_str()?;
    if let Some(name) = file.strip_suffix(MANIFEST_SUFFIX) {
        return Some(name.to_string());
    }
    let name = file.split('.').next()?;
    if name.is_empty() || name == file {
        return None;
    }
    Some(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spirv_bytes(extra_words: u32) -> Vec<u8> {
        let mut bytes = SPIRV_MAGIC.to_le_bytes().to_vec();
        for i in 0..extra_words {
            bytes.extend_from_slice(&i.to_le_bytes());
        }
        bytes
    }

    #[test]
    fn spirv_magic_is_checked() {
        assert_eq!(spirv_words(&spirv_bytes(3)).unwrap().len(), 4);
        assert!(spirv_words(&[1, 2, 3, 4]).is_err());
        assert!(spirv_words(&[3, 2, 0x23, 0x07, 0]).is_err());
    }

    #[test]
    fn shader_names_from_paths() {
        assert_eq!(shader_name_for(Path::new("shaders/triangle.shader.toml")).as_deref(), Some("triangle"));
        assert_eq!(shader_name_for(Path::new("shaders/triangle.vert.spv")).as_deref(), Some("triangle"));
        assert_eq!(shader_name_for(Path::new("shaders/README")), None);
    }

    #[test]
    fn manifest_source_reads_stages_and_reflection() {
        let dir = std::env::temp_dir().join(format!("render-core-shader-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("quad.vert.spv"), spirv_bytes(4)).unwrap();
        std::fs::write(dir.join("quad.frag.spv"), spirv_bytes(2)).unwrap();
        std::fs::write(
            dir.join("quad.shader.toml"),
            r#"
[[stage]]
stage = "vertex"
spirv = "quad.vert.spv"

[[stage.resources]]
name = "camera"
binding = 0
kind = "uniform_buffer"
size = 64

[[stage.inputs]]
name = "position"
location = 0
format = "float3"

[[stage]]
stage = "fragment"
spirv = "quad.frag.spv"

[[stage.resources]]
name = "albedo"
binding = 1
kind = "sampled_image"
count = 4
"#,
        )
        .unwrap();

        let source = ManifestShaderSource::new(&dir);
        let shader = source.load("quad").unwrap();
        assert_eq!(shader.stages.len(), 2);

        let vertex = shader.stage(Stage::Vertex).unwrap();
        assert_eq!(vertex.entry_point, "main");
        assert_eq!(vertex.words.len(), 5);
        assert_eq!(vertex.reflection.resources[0].set, 0);
        assert_eq!(vertex.reflection.resources[0].count, 1);
        assert_eq!(vertex.reflection.inputs[0].format, VertexFormat::Float3);

        let fragment = shader.stage(Stage::Fragment).unwrap();
        assert_eq!(fragment.reflection.resources[0].kind, ResourceKind::SampledImage);
        assert_eq!(fragment.reflection.resources[0].count, 4);

        assert!(source.load("missing").is_err());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn library_shares_and_reloads_in_place() {
        let source = Arc::new(InMemoryShaderSource::new());
        source.insert("flat", CompiledShader::default());
        let library = ShaderLibrary::new(Box::new(source.clone()));

        let a = library.get("flat").unwrap();
        let b = library.get("flat").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.generation(), 0);

        let reloaded = library.reload("flat").unwrap().unwrap();
        assert!(Arc::ptr_eq(&a, &reloaded));
        assert_eq!(a.generation(), 1);
        assert!(library.reload("never-loaded").unwrap().is_none());
    }
}
