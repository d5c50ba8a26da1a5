//! User hooks, plugins and their execution graph
//!
//! The user app and each plugin are records of optional hook closures: a
//! hook that is present runs, an absent one means the frame passes through.
//! Plugins wrap every user hook with `before_*`/`after_*` advice in the
//! configured order. The three frame-returning hooks must hand a frame back;
//! a present hook returning nothing kills the worker.

use crate::messages::RgbImage;
use crate::worker::inference::Tensor;
use libloading::Library;
use log::{debug, info, warn};
use std::any::Any;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::path::Path;
use std::time::{Duration, Instant};

/// Symbol the user artifact exports to build a fresh app instance.
pub const APP_SYMBOL: &[u8] = b"framewire_app";

/// Symbol a plugin artifact exports to build a fresh plugin instance.
pub const PLUGIN_SYMBOL: &[u8] = b"framewire_plugin";

/// Hook execution errors
#[derive(Debug)]
pub enum HookError {
    /// The artifact could not be loaded or lacks the expected export
    AppLoad(String),
    /// A frame-returning hook returned nothing
    NoFrameReturned(Stage),
    /// A hook returned a frame of a different shape
    ShapeChanged(Stage),
}

impl fmt::Display for HookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookError::AppLoad(msg) => write!(f, "failed to load the app artifact: {}", msg),
            HookError::NoFrameReturned(stage) => {
                write!(f, "the {} hook forgot to return a frame", stage.name())
            }
            HookError::ShapeChanged(stage) => {
                write!(f, "the {} hook returned a frame of a different shape", stage.name())
            }
        }
    }
}

impl Error for HookError {}

/// The five fixed points of the per-frame pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Before,
    PreProcess,
    Process,
    PostProcess,
    After,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Before => "before",
            Stage::PreProcess => "pre_process",
            Stage::Process => "process",
            Stage::PostProcess => "post_process",
            Stage::After => "after",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wrap {
    Before,
    After,
}

fn wrap_label(stage: Stage, when: Wrap) -> &'static str {
    match (when, stage) {
        (Wrap::Before, Stage::Before) => "before_before",
        (Wrap::After, Stage::Before) => "after_before",
        (Wrap::Before, Stage::PreProcess) => "before_pre_process",
        (Wrap::After, Stage::PreProcess) => "after_pre_process",
        (Wrap::Before, Stage::Process) => "before_process",
        (Wrap::After, Stage::Process) => "after_process",
        (Wrap::Before, Stage::PostProcess) => "before_post_process",
        (Wrap::After, Stage::PostProcess) => "after_post_process",
        (Wrap::Before, Stage::After) => "before_after",
        (Wrap::After, Stage::After) => "after_after",
    }
}

/// Per-stream state injected into every hook invocation.
pub struct AppContext {
    /// Read-only view of the frame currently travelling the chain
    pub original_frame: Option<RgbImage>,
    /// Output of the inference session, when one is configured
    pub inference_results: Option<Tensor>,
    plugin_state: HashMap<String, Box<dyn Any + Send>>,
}

impl AppContext {
    pub fn new() -> Self {
        AppContext { original_frame: None, inference_results: None, plugin_state: HashMap::new() }
    }

    /// Stash state under a plugin id, visible to the app hooks.
    pub fn set_plugin_state<T: Any + Send>(&mut self, id: &str, state: T) {
        self.plugin_state.insert(id.to_string(), Box::new(state));
    }

    pub fn plugin_state<T: Any + Send>(&self, id: &str) -> Option<&T> {
        self.plugin_state.get(id).and_then(|state| state.downcast_ref())
    }

    pub fn plugin_state_mut<T: Any + Send>(&mut self, id: &str) -> Option<&mut T> {
        self.plugin_state.get_mut(id).and_then(|state| state.downcast_mut())
    }
}

impl Default for AppContext {
    fn default() -> Self {
        Self::new()
    }
}

/// A hook that only observes the stream boundary.
pub type StageHookFn = Box<dyn FnMut(&mut AppContext) + Send>;

/// A user hook in the frame chain. Returning `None` is a contract violation.
pub type FrameHookFn = Box<dyn FnMut(RgbImage, &mut AppContext) -> Option<RgbImage> + Send>;

/// Plugin advice around a frame hook; always passes a frame on.
pub type WrapHookFn = Box<dyn FnMut(RgbImage, &mut AppContext) -> RgbImage + Send>;

/// The optional hooks of a user app. Absent hooks pass the frame through.
#[derive(Default)]
pub struct AppHooks {
    pub before: Option<StageHookFn>,
    pub pre_process: Option<FrameHookFn>,
    pub process: Option<FrameHookFn>,
    pub post_process: Option<FrameHookFn>,
    pub after: Option<StageHookFn>,
}

impl AppHooks {
    fn frame_hook(&mut self, stage: Stage) -> Option<&mut FrameHookFn> {
        match stage {
            Stage::PreProcess => self.pre_process.as_mut(),
            Stage::Process => self.process.as_mut(),
            Stage::PostProcess => self.post_process.as_mut(),
            Stage::Before | Stage::After => None,
        }
    }

    fn stage_hook(&mut self, stage: Stage) -> Option<&mut StageHookFn> {
        match stage {
            Stage::Before => self.before.as_mut(),
            Stage::After => self.after.as_mut(),
            _ => None,
        }
    }
}

/// The optional advice hooks of a plugin: one `before_*`/`after_*` pair per
/// user hook.
#[derive(Default)]
pub struct PluginHooks {
    pub before_before: Option<StageHookFn>,
    pub after_before: Option<StageHookFn>,
    pub before_pre_process: Option<WrapHookFn>,
    pub after_pre_process: Option<WrapHookFn>,
    pub before_process: Option<WrapHookFn>,
    pub after_process: Option<WrapHookFn>,
    pub before_post_process: Option<WrapHookFn>,
    pub after_post_process: Option<WrapHookFn>,
    pub before_after: Option<StageHookFn>,
    pub after_after: Option<StageHookFn>,
}

impl PluginHooks {
    fn wrapper(&mut self, stage: Stage, when: Wrap) -> Option<&mut WrapHookFn> {
        match (when, stage) {
            (Wrap::Before, Stage::PreProcess) => self.before_pre_process.as_mut(),
            (Wrap::After, Stage::PreProcess) => self.after_pre_process.as_mut(),
            (Wrap::Before, Stage::Process) => self.before_process.as_mut(),
            (Wrap::After, Stage::Process) => self.after_process.as_mut(),
            (Wrap::Before, Stage::PostProcess) => self.before_post_process.as_mut(),
            (Wrap::After, Stage::PostProcess) => self.after_post_process.as_mut(),
            _ => None,
        }
    }

    fn stage_wrapper(&mut self, stage: Stage, when: Wrap) -> Option<&mut StageHookFn> {
        match (when, stage) {
            (Wrap::Before, Stage::Before) => self.before_before.as_mut(),
            (Wrap::After, Stage::Before) => self.after_before.as_mut(),
            (Wrap::Before, Stage::After) => self.before_after.as_mut(),
            (Wrap::After, Stage::After) => self.after_after.as_mut(),
            _ => None,
        }
    }

    /// Whether the plugin wraps the `process` stage. Forbidden when an
    /// inference session replaces that stage.
    pub fn touches_process(&self) -> bool {
        self.before_process.is_some() || self.after_process.is_some()
    }
}

/// A plugin bound into the execution graph.
pub struct LoadedPlugin {
    pub id: String,
    pub hooks: PluginHooks,
    _lib: Option<Library>,
}

impl LoadedPlugin {
    pub fn new(id: impl Into<String>, hooks: PluginHooks) -> Self {
        LoadedPlugin { id: id.into(), hooks, _lib: None }
    }
}

/// The user artifact: a dynamic library exporting an app constructor and,
/// optionally, an inference session factory. Kept loaded for the whole
/// worker lifetime; instances are rebuilt per stream.
pub struct AppArtifact {
    library: Library,
}

impl AppArtifact {
    pub fn load(path: &Path) -> Result<AppArtifact, HookError> {
        let library = unsafe { Library::new(path) }
            .map_err(|e| HookError::AppLoad(format!("{}: {}", path.display(), e)))?;
        Ok(AppArtifact { library })
    }

    /// Build a fresh app instance for a new stream.
    pub fn instantiate(&self) -> Result<AppHooks, HookError> {
        let constructor: libloading::Symbol<fn() -> AppHooks> =
            unsafe { self.library.get(APP_SYMBOL) }.map_err(|e| {
                HookError::AppLoad(format!("artifact exports no app constructor: {}", e))
            })?;
        Ok(constructor())
    }

    pub fn library(&self) -> &Library {
        &self.library
    }
}

/// Load the plugins named by the configured execution order. Identifiers
/// without an artifact on disk are warned about and skipped.
pub fn load_plugins(dir: &Path, order: &[String]) -> Vec<LoadedPlugin> {
    let mut graph = Vec::new();
    for id in order {
        let path = dir.join(id).join(format!("plugin.{}", std::env::consts::DLL_EXTENSION));
        if !path.is_file() {
            warn!(
                "The plugin with ID '{}' is not in the plugins directory: '{}'. Ignoring plugin.",
                id,
                dir.display()
            );
            continue;
        }
        let library = match unsafe { Library::new(&path) } {
            Ok(library) => library,
            Err(e) => {
                warn!("Failed to load plugin '{}': {}", id, e);
                continue;
            }
        };
        let hooks = {
            let constructor: libloading::Symbol<fn() -> PluginHooks> =
                match unsafe { library.get(PLUGIN_SYMBOL) } {
                    Ok(constructor) => constructor,
                    Err(e) => {
                        warn!("Plugin '{}' exports no constructor: {}", id, e);
                        continue;
                    }
                };
            constructor()
        };
        info!("Loaded plugin with id: {}", id);
        graph.push(LoadedPlugin { id: id.clone(), hooks, _lib: Some(library) });
    }
    graph
}

/// Explicit timing wrapper around every hook invocation, replacing
/// decorator-style instrumentation.
struct Timing {
    show_exec_time: bool,
    profiler: Option<Profiler>,
}

impl Timing {
    fn observe(&mut self, plugin: Option<&str>, label: &'static str, elapsed: Duration) {
        if self.show_exec_time {
            match plugin {
                Some(id) => debug!("{} {} executed in {:.4} seconds", id, label, elapsed.as_secs_f64()),
                None => debug!("{} executed in {:.4} seconds", label, elapsed.as_secs_f64()),
            }
        }
        if let Some(profiler) = &mut self.profiler {
            profiler.record(plugin, label, elapsed);
        }
    }
}

#[derive(Default)]
struct Profiler {
    totals: HashMap<String, (u64, Duration)>,
}

impl Profiler {
    fn record(&mut self, plugin: Option<&str>, label: &'static str, elapsed: Duration) {
        let key = match plugin {
            Some(id) => format!("{}.{}", id, label),
            None => label.to_string(),
        };
        let entry = self.totals.entry(key).or_insert((0, Duration::ZERO));
        entry.0 += 1;
        entry.1 += elapsed;
    }

    fn log_summary(&mut self) {
        if self.totals.is_empty() {
            return;
        }
        let mut rows: Vec<_> = self.totals.drain().collect();
        rows.sort_by(|a, b| b.1 .1.cmp(&a.1 .1));
        info!("Hook timings for the finished stream:");
        for (label, (calls, total)) in rows {
            info!(
                "  {}: {} calls, {:.4} seconds total, {:.4} seconds avg",
                label,
                calls,
                total.as_secs_f64(),
                total.as_secs_f64() / calls as f64
            );
        }
    }
}

/// The composed execution graph: ordered plugins wrapped around the user
/// hooks.
pub struct HookGraph {
    app: AppHooks,
    plugins: Vec<LoadedPlugin>,
    timing: Timing,
}

impl HookGraph {
    pub fn new(
        app: AppHooks,
        plugins: Vec<LoadedPlugin>,
        show_exec_time: bool,
        enable_profiler: bool,
    ) -> Self {
        HookGraph {
            app,
            plugins,
            timing: Timing {
                show_exec_time,
                profiler: enable_profiler.then(Profiler::default),
            },
        }
    }

    /// Whether any plugin wraps the `process` stage.
    pub fn has_process_plugins(&self) -> bool {
        self.plugins.iter().any(|plugin| plugin.hooks.touches_process())
    }

    /// Identifiers of the plugins wrapping the `process` stage.
    pub fn process_plugin_ids(&self) -> Vec<&str> {
        self.plugins
            .iter()
            .filter(|plugin| plugin.hooks.touches_process())
            .map(|plugin| plugin.id.as_str())
            .collect()
    }

    /// Run a non-frame stage (`before`/`after`) with its plugin advice.
    pub fn run_stage(&mut self, stage: Stage, ctx: &mut AppContext) {
        for plugin in self.plugins.iter_mut() {
            if let Some(hook) = plugin.hooks.stage_wrapper(stage, Wrap::Before) {
                let started = Instant::now();
                hook(ctx);
                self.timing.observe(Some(&plugin.id), wrap_label(stage, Wrap::Before), started.elapsed());
            }
        }
        if let Some(hook) = self.app.stage_hook(stage) {
            let started = Instant::now();
            hook(ctx);
            self.timing.observe(None, stage.name(), started.elapsed());
        }
        for plugin in self.plugins.iter_mut() {
            if let Some(hook) = plugin.hooks.stage_wrapper(stage, Wrap::After) {
                let started = Instant::now();
                hook(ctx);
                self.timing.observe(Some(&plugin.id), wrap_label(stage, Wrap::After), started.elapsed());
            }
        }
    }

    /// Run one frame stage: plugin `before_*` advice in order, the user
    /// hook, then plugin `after_*` advice in order.
    pub fn run_frame_stage(
        &mut self,
        stage: Stage,
        frame: RgbImage,
        ctx: &mut AppContext,
    ) -> Result<RgbImage, HookError> {
        let mut frame = frame;
        for plugin in self.plugins.iter_mut() {
            if let Some(hook) = plugin.hooks.wrapper(stage, Wrap::Before) {
                let started = Instant::now();
                frame = hook(frame, ctx);
                self.timing.observe(Some(&plugin.id), wrap_label(stage, Wrap::Before), started.elapsed());
            }
        }
        if let Some(hook) = self.app.frame_hook(stage) {
            let width = frame.width();
            let height = frame.height();
            let started = Instant::now();
            let returned = hook(frame, ctx).ok_or(HookError::NoFrameReturned(stage))?;
            self.timing.observe(None, stage.name(), started.elapsed());
            if returned.width() != width || returned.height() != height {
                return Err(HookError::ShapeChanged(stage));
            }
            frame = returned;
        }
        for plugin in self.plugins.iter_mut() {
            if let Some(hook) = plugin.hooks.wrapper(stage, Wrap::After) {
                let started = Instant::now();
                frame = hook(frame, ctx);
                self.timing.observe(Some(&plugin.id), wrap_label(stage, Wrap::After), started.elapsed());
            }
        }
        Ok(frame)
    }

    /// Stream boundary bookkeeping.
    pub fn end_stream(&mut self) {
        if let Some(profiler) = &mut self.timing.profiler {
            profiler.log_summary();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::{Arc, Mutex};

    fn frame() -> RgbImage {
        RgbImage::new(2, 2, Bytes::from(vec![1u8; 12]), None, Some(0), None, 0, 30.0).unwrap()
    }

    fn trace() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> WrapHookFn) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let make = {
            let log = log.clone();
            move |label: &str| -> WrapHookFn {
                let log = log.clone();
                let label = label.to_string();
                Box::new(move |frame, _ctx: &mut AppContext| {
                    log.lock().unwrap().push(label.clone());
                    frame
                })
            }
        };
        (log, make)
    }

    #[test]
    fn plugins_wrap_the_user_hook_in_order() {
        let (log, wrap) = trace();
        let first = LoadedPlugin::new(
            "first",
            PluginHooks {
                before_pre_process: Some(wrap("first.before")),
                after_pre_process: Some(wrap("first.after")),
                ..Default::default()
            },
        );
        let second = LoadedPlugin::new(
            "second",
            PluginHooks {
                before_pre_process: Some(wrap("second.before")),
                after_pre_process: Some(wrap("second.after")),
                ..Default::default()
            },
        );
        let app_log = log.clone();
        let app = AppHooks {
            pre_process: Some(Box::new(move |frame, _ctx| {
                app_log.lock().unwrap().push("app".to_string());
                Some(frame)
            })),
            ..Default::default()
        };

        let mut graph = HookGraph::new(app, vec![first, second], false, false);
        let mut ctx = AppContext::new();
        graph.run_frame_stage(Stage::PreProcess, frame(), &mut ctx).unwrap();

        assert_eq!(
            log.lock().unwrap().as_slice(),
            ["first.before", "second.before", "app", "first.after", "second.after"]
        );
    }

    #[test]
    fn absent_hooks_pass_the_frame_through() {
        let mut graph = HookGraph::new(AppHooks::default(), Vec::new(), false, false);
        let mut ctx = AppContext::new();
        let input = frame();
        let output = graph.run_frame_stage(Stage::Process, input.clone(), &mut ctx).unwrap();
        assert_eq!(input, output);
    }

    #[test]
    fn missing_return_is_fatal() {
        let app = AppHooks {
            post_process: Some(Box::new(|_frame, _ctx| None)),
            ..Default::default()
        };
        let mut graph = HookGraph::new(app, Vec::new(), false, false);
        let mut ctx = AppContext::new();
        let err = graph.run_frame_stage(Stage::PostProcess, frame(), &mut ctx).unwrap_err();
        assert!(err.to_string().contains("forgot to return a frame"));
        assert!(err.to_string().contains("post_process"));
    }

    #[test]
    fn shape_changes_are_rejected() {
        let app = AppHooks {
            process: Some(Box::new(|_frame, _ctx| {
                Some(
                    RgbImage::new(1, 1, Bytes::from(vec![0u8; 3]), None, None, None, 0, 30.0)
                        .unwrap(),
                )
            })),
            ..Default::default()
        };
        let mut graph = HookGraph::new(app, Vec::new(), false, false);
        let mut ctx = AppContext::new();
        let err = graph.run_frame_stage(Stage::Process, frame(), &mut ctx).unwrap_err();
        assert!(matches!(err, HookError::ShapeChanged(Stage::Process)));
    }

    #[test]
    fn process_plugins_are_detected() {
        let plugin = LoadedPlugin::new(
            "boxes",
            PluginHooks {
                before_process: Some(Box::new(|frame, _ctx| frame)),
                ..Default::default()
            },
        );
        let graph = HookGraph::new(AppHooks::default(), vec![plugin], false, false);
        assert!(graph.has_process_plugins());

        let benign = LoadedPlugin::new(
            "draw",
            PluginHooks {
                after_post_process: Some(Box::new(|frame, _ctx| frame)),
                ..Default::default()
            },
        );
        let graph = HookGraph::new(AppHooks::default(), vec![benign], false, false);
        assert!(!graph.has_process_plugins());
    }

    #[test]
    fn plugins_share_state_with_the_app_through_the_context() {
        let plugin = LoadedPlugin::new(
            "counter",
            PluginHooks {
                before_pre_process: Some(Box::new(|frame, ctx: &mut AppContext| {
                    let count = ctx.plugin_state_mut::<u32>("counter").copied().unwrap_or(0) + 1;
                    ctx.set_plugin_state("counter", count);
                    frame
                })),
                ..Default::default()
            },
        );
        let seen = Arc::new(Mutex::new(0u32));
        let seen_in_app = seen.clone();
        let app = AppHooks {
            pre_process: Some(Box::new(move |frame, ctx| {
                *seen_in_app.lock().unwrap() = ctx.plugin_state::<u32>("counter").copied().unwrap_or(0);
                Some(frame)
            })),
            ..Default::default()
        };
        let mut graph = HookGraph::new(app, vec![plugin], false, false);
        let mut ctx = AppContext::new();
        graph.run_frame_stage(Stage::PreProcess, frame(), &mut ctx).unwrap();
        graph.run_frame_stage(Stage::PreProcess, frame(), &mut ctx).unwrap();
        assert_eq!(*seen.lock().unwrap(), 2);
    }

    #[test]
    fn stage_hooks_run_without_frames() {
        let ran = Arc::new(Mutex::new(Vec::new()));
        let log = ran.clone();
        let app = AppHooks {
            before: Some(Box::new(move |_ctx| log.lock().unwrap().push("before"))),
            ..Default::default()
        };
        let log = ran.clone();
        let plugin = LoadedPlugin::new(
            "p",
            PluginHooks {
                after_before: Some(Box::new(move |_ctx| log.lock().unwrap().push("p.after_before"))),
                ..Default::default()
            },
        );
        let mut graph = HookGraph::new(app, vec![plugin], false, false);
        let mut ctx = AppContext::new();
        graph.run_stage(Stage::Before, &mut ctx);
        assert_eq!(ran.lock().unwrap().as_slice(), ["before", "p.after_before"]);
    }
}
