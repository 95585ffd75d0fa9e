// SPDX-License-Identifier: MIT OR Apache-2.0
//! Graph instances: nodes embedding another graph.
//!
//! An instance loads its graph from a resource path, resolved in order:
//!
//! 1. Inside the archive the host graph came from, as
//!    `resources/<file>` (an archive nested in an archive).
//! 2. The path itself, when it names an archive on disk.
//! 3. `<cwd>/resources/<file>` for an archive copied next to the host graph.
//! 4. The path itself, when it names a plain graph file.
//!
//! When none of these yields a graph, the definition saved with the host
//! graph is used instead. The embedded graph is read-only; its inputs and
//! outputs become the instance node's ports.

use crate::archive::MtgArchive;
use crate::config::EngineConfig;
use crate::context::EngineContext;
use crate::error::LoadError;
use crate::evaluation::PushDown;
use crate::graph::{instance_format, mirrored_input, mirrored_output, Graph, Lineage};
use crate::node::NodeId;
use crate::params::{GraphParameterValue, ParamKey, ParamValue};
use crate::port::Port;
use crate::record::{GraphRecord, InstanceRecord};
use indexmap::IndexMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use texgraph_gpu::{Buffer, PixelFormat};

/// Where an instance's graph was found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    /// An archive nested in the host graph's archive
    NestedArchive,
    /// An archive at the given path
    Archive,
    /// An archive in the host's resource directory
    ResourceArchive,
    /// A plain graph file
    GraphFile,
    /// The definition saved with the host graph
    RawData,
}

/// Everything an instance needs from its host graph to load
#[derive(Debug, Clone)]
pub(crate) struct LoadContext {
    pub ctx: Rc<EngineContext>,
    pub parent: Lineage,
    pub host: NodeId,
    pub archive: Option<MtgArchive>,
    pub cwd: Option<PathBuf>,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub asynchronous: bool,
}

struct Found {
    text: String,
    archive: Option<MtgArchive>,
    source: LoadSource,
}

/// State of an instance node
#[derive(Debug, Default)]
pub struct GraphInstance {
    graph: Option<Graph>,
    name: Option<String>,
    path: Option<String>,
    raw_data: Option<String>,
    source: Option<LoadSource>,
    // Values restored from a saved host, applied after every load
    pending_parameters: IndexMap<ParamKey, ParamValue>,
    pending_custom: IndexMap<String, ParamValue>,
    random_seed: Option<i32>,
    custom_names: IndexMap<String, usize>,
    input_map: Vec<NodeId>,
    output_map: Vec<NodeId>,
}

impl GraphInstance {
    /// Create an empty instance
    pub fn new() -> Self {
        Self::default()
    }

    /// Embedded graph
    pub fn graph(&self) -> Option<&Graph> {
        self.graph.as_ref()
    }

    pub(crate) fn graph_mut(&mut self) -> Option<&mut Graph> {
        self.graph.as_mut()
    }

    /// Name taken from the loaded resource
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Resource path
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Serialized definition kept for fallback loading
    pub fn raw_data(&self) -> Option<&str> {
        self.raw_data.as_deref()
    }

    /// How the current graph was obtained
    pub fn source(&self) -> Option<LoadSource> {
        self.source
    }

    /// Whether a graph is loaded
    pub fn is_loaded(&self) -> bool {
        self.graph.is_some()
    }

    /// Embedded input node behind an instance input
    pub fn input_node(&self, index: usize) -> Option<NodeId> {
        self.input_map.get(index).copied()
    }

    /// Embedded output node behind an instance output
    pub fn output_node(&self, index: usize) -> Option<NodeId> {
        self.output_map.get(index).copied()
    }

    /// Custom parameter of the embedded graph, by name
    pub fn custom_parameter(&self, name: &str) -> Option<&GraphParameterValue> {
        let index = *self.custom_names.get(name)?;
        self.graph.as_ref()?.custom_parameters().get(index)
    }

    pub(crate) fn from_record(record: InstanceRecord, lc: &LoadContext) -> Self {
        let mut inst = Self {
            raw_data: record.raw_data,
            pending_parameters: record.parameters,
            pending_custom: record.custom_parameters,
            random_seed: Some(record.random_seed),
            ..Self::default()
        };
        match record.path.filter(|p| !p.is_empty()) {
            Some(path) => {
                inst.load(&path, lc);
            }
            None => {
                inst.fallback(lc);
            }
        }
        inst
    }

    pub(crate) fn to_record(&self) -> InstanceRecord {
        let (parameters, custom_parameters, random_seed) = match &self.graph {
            Some(graph) => (
                graph.constant_parameters(),
                graph.custom_parameter_values(),
                graph.random_seed(),
            ),
            None => (
                self.pending_parameters.clone(),
                self.pending_custom.clone(),
                self.random_seed.unwrap_or_default(),
            ),
        };
        InstanceRecord {
            raw_data: self.raw_data.clone(),
            path: self.path.clone(),
            parameters,
            custom_parameters,
            random_seed,
        }
    }

    /// Resolve `path` and load its graph, falling back to the saved definition
    pub(crate) fn load(&mut self, path: &str, lc: &LoadContext) -> bool {
        let _span = tracing::debug_span!("load_instance", path).entered();
        self.graph = None;
        self.path = Some(path.to_string());

        if let Some(found) = resolve(path, lc) {
            match self.prepare(&found.text, found.archive, lc) {
                Ok(()) => {
                    self.name = file_stem(path);
                    self.source = Some(found.source);
                    tracing::info!("Loaded graph instance {} ({:?})", path, found.source);
                    return true;
                }
                Err(e) => tracing::warn!("Graph instance {} could not be decoded: {}", path, e),
            }
        }
        self.fallback(lc)
    }

    fn fallback(&mut self, lc: &LoadContext) -> bool {
        let Some(raw) = self.raw_data.clone() else {
            tracing::warn!(
                "Graph instance {} is unresolved and has no saved definition",
                self.path.as_deref().unwrap_or("<unnamed>")
            );
            self.source = None;
            return false;
        };
        match self.prepare(&raw, None, lc) {
            Ok(()) => {
                self.name = self.graph.as_ref().map(|g| g.name.clone());
                self.source = Some(LoadSource::RawData);
                tracing::warn!(
                    "Graph instance {} is unresolved, using its saved definition",
                    self.path.as_deref().unwrap_or("<unnamed>")
                );
                true
            }
            Err(e) => {
                tracing::warn!("Saved definition of graph instance is invalid: {}", e);
                self.source = None;
                false
            }
        }
    }

    fn prepare(&mut self, text: &str, archive: Option<MtgArchive>, lc: &LoadContext) -> Result<(), LoadError> {
        let record: GraphRecord = serde_json::from_str(text)?;
        let lineage = lc.parent.child(lc.host);
        let mut graph = Graph::from_record(record, lc.ctx.clone(), lineage, archive, lc.cwd.clone())?;

        graph.read_only = true;
        graph.synchronized = !lc.asynchronous;
        graph.assign_parameters(&self.pending_parameters);
        graph.assign_custom_parameters(&self.pending_custom);
        if let Some(seed) = self.random_seed {
            graph.assign_seed(seed);
        }
        graph.assign_pixel_format(instance_format(lc.pixel_format));
        graph.resize_with(lc.width, lc.height);

        self.custom_names = graph
            .custom_parameters()
            .iter()
            .enumerate()
            .map(|(i, p)| (p.name.clone(), i))
            .collect();
        self.input_map = graph.input_nodes().to_vec();
        self.output_map = graph.output_nodes().to_vec();
        self.raw_data = Some(text.to_string());
        self.graph = Some(graph);
        Ok(())
    }

    /// Ports mirroring the embedded graph's inputs and outputs
    pub(crate) fn ports(&self) -> (Vec<Port>, Vec<Port>) {
        let Some(graph) = &self.graph else {
            return (Vec::new(), Vec::new());
        };
        let name = |id: &NodeId| graph.node(*id).map_or_else(String::new, |n| n.name.clone());
        (
            self.input_map.iter().map(|id| mirrored_input(&name(id))).collect(),
            self.output_map.iter().map(|id| mirrored_output(&name(id))).collect(),
        )
    }

    /// Push parent values, feed inputs, process, and collect output buffers
    pub(crate) fn run(&mut self, push: PushDown, inputs: &[Option<Buffer>]) -> Option<Vec<Option<Buffer>>> {
        let graph = self.graph.as_mut()?;
        graph.apply_pushdown(push);
        for (index, id) in self.input_map.iter().enumerate() {
            graph.feed_input(*id, inputs.get(index).cloned().flatten());
        }
        graph.try_and_process_all();
        graph.process_pending();
        graph.release_intermediate_buffers();
        Some(self.output_map.iter().map(|id| graph.exposed_output(*id)).collect())
    }

    /// Drop every buffer the embedded graph holds
    pub(crate) fn clear(&mut self) {
        if let Some(graph) = &mut self.graph {
            graph.clear_buffers();
        }
    }

    /// Copy a standalone archive into `<cwd>/resources` so the host graph
    /// can be moved with its resources.
    ///
    /// Returns the copied file, or `None` when the instance does not come
    /// from a standalone archive.
    pub fn copy_resources(&self, cwd: &Path, config: &EngineConfig) -> Result<Option<PathBuf>, LoadError> {
        let Some(path) = &self.path else {
            return Ok(None);
        };
        if self.source != Some(LoadSource::Archive) {
            return Ok(None);
        }
        let source = Path::new(path);
        let file_name = source
            .file_name()
            .ok_or_else(|| LoadError::Unresolved(path.clone()))?;
        let dir = cwd.join(&config.resource_dir);
        std::fs::create_dir_all(&dir)?;
        let target = dir.join(file_name);
        if target != source {
            std::fs::copy(source, &target)?;
            tracing::info!("Copied {} to {}", source.display(), target.display());
        }
        Ok(Some(target))
    }
}

impl Graph {
    /// Copy the standalone archives of every instance into `<cwd>/resources`
    pub fn copy_resources(&self, cwd: &Path) -> Result<Vec<PathBuf>, LoadError> {
        let mut copied = Vec::new();
        for node in self.nodes() {
            if let Some(inst) = node.instance() {
                copied.extend(inst.copy_resources(cwd, self.ctx.config())?);
            }
        }
        Ok(copied)
    }
}

fn file_stem(path: &str) -> Option<String> {
    let normalized = path.replace('\\', "/");
    Path::new(&normalized)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
}

fn resolve(path: &str, lc: &LoadContext) -> Option<Found> {
    let config = lc.ctx.config();
    let normalized = path.replace('\\', "/");
    let file_name = Path::new(&normalized).file_name()?.to_string_lossy().into_owned();
    let on_disk = Path::new(path);

    let found = if config.is_archive_path(path) {
        if let Some(parent) = &lc.archive {
            // Inside an archive, resources only come from that archive
            let relative = format!("{}/{}", config.resource_dir, file_name);
            nested_archive(parent.clone(), &relative, config).map(|(text, archive)| Found {
                text,
                archive: Some(archive),
                source: LoadSource::NestedArchive,
            })
        } else if on_disk.is_file() {
            read_archive(on_disk, config).map(|(text, archive)| Found {
                text,
                archive: Some(archive),
                source: LoadSource::Archive,
            })
        } else {
            let local = lc
                .cwd
                .as_ref()
                .map(|cwd| cwd.join(&config.resource_dir).join(&file_name))
                .filter(|p| p.is_file());
            match local {
                Some(local) => read_archive(&local, config).map(|(text, archive)| Found {
                    text,
                    archive: Some(archive),
                    source: LoadSource::ResourceArchive,
                }),
                None => Err(LoadError::Unresolved(path.to_string())),
            }
        }
    } else if config.is_graph_path(path) && on_disk.is_file() {
        std::fs::read_to_string(on_disk).map_err(LoadError::from).map(|text| Found {
            text,
            archive: None,
            source: LoadSource::GraphFile,
        })
    } else {
        Err(LoadError::Unresolved(path.to_string()))
    };

    match found {
        Ok(found) => Some(found),
        Err(e) => {
            tracing::debug!("Could not resolve {}: {}", path, e);
            None
        }
    }
}

fn read_archive(path: &Path, config: &EngineConfig) -> Result<(String, MtgArchive), LoadError> {
    graph_from_archive(MtgArchive::from_path(path)?, config)
}

fn nested_archive(
    mut parent: MtgArchive,
    relative: &str,
    config: &EngineConfig,
) -> Result<(String, MtgArchive), LoadError> {
    parent.open()?;
    let entry = parent
        .find_exact(relative)?
        .ok_or_else(|| LoadError::MissingEntry(relative.to_string()))?;
    let bytes = parent.extract_binary(&entry)?;
    parent.close();
    graph_from_archive(MtgArchive::from_bytes(entry, bytes), config)
}

/// Extract the graph definition stored in an archive
pub(crate) fn graph_from_archive(
    mut archive: MtgArchive,
    config: &EngineConfig,
) -> Result<(String, MtgArchive), LoadError> {
    archive.open()?;
    let suffix = format!(".{}", config.graph_extension);
    let entry = archive
        .find_by_suffix(&suffix)?
        .ok_or_else(|| LoadError::MissingEntry(suffix.clone()))?;
    let text = archive.extract_text(&entry)?;
    archive.close();
    Ok((text, archive))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_stem_handles_both_separators() {
        assert_eq!(file_stem("C:\\graphs\\brick.mtga").as_deref(), Some("brick"));
        assert_eq!(file_stem("/tmp/resources/wood.mtg").as_deref(), Some("wood"));
    }

    #[test]
    fn test_graph_from_archive() {
        let bytes = MtgArchive::pack(&[("x/inner.mtg", b"{\"name\":\"inner\"}".as_slice())]).unwrap();
        let (text, archive) = graph_from_archive(MtgArchive::from_bytes("a.mtga", bytes), &EngineConfig::default()).unwrap();
        assert!(text.contains("inner"));
        assert!(!archive.is_open());
    }

    #[test]
    fn test_archive_without_graph() {
        let bytes = MtgArchive::pack(&[("readme.txt", b"hello".as_slice())]).unwrap();
        let result = graph_from_archive(MtgArchive::from_bytes("a.mtga", bytes), &EngineConfig::default());
        assert!(matches!(result, Err(LoadError::MissingEntry(_))));
    }

    #[test]
    fn test_empty_instance() {
        let inst = GraphInstance::new();
        assert!(!inst.is_loaded());
        let (inputs, outputs) = inst.ports();
        assert!(inputs.is_empty() && outputs.is_empty());
        assert!(inst.custom_parameter("Scale").is_none());
        let record = inst.to_record();
        assert!(record.raw_data.is_none());
        assert_eq!(record.random_seed, 0);
    }
}
