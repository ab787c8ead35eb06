mod canvas;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use crossterm::cursor;
use crossterm::event::{self, DisableMouseCapture, EnableMouseCapture};
use crossterm::terminal::{self, Clear, ClearType};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tilemark_core::{
    analysis_file_name, Command, EditPhase, FileStateStore, LoadTicket, Page, Polygon, SaveRequest,
    StageSize, StateStore, TileImage, TileKey, TileSource, TileStore, Viewer, ViewerConfig,
    ViewerEvent, WorkspaceId, WorkspaceSource,
};
use tilemark_http::{ClientConfig, HttpClient};
use tilemark_tty::{
    write_status_line, CellGrid, DrawParams, EventMapper, InputMode, KittyRenderer, UiEvent,
};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(
    name = "tilemark",
    version,
    about = "kitty-native viewer and polygon editor for tiled document workspaces"
)]
struct Args {
    /// Server root for the REST API and tile media
    #[arg(short = 'u', long = "base-url")]
    base_url: Option<String>,

    /// Configuration file (defaults to config.toml in the platform config dir)
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Directory that analysis exports are written to
    #[arg(long = "export-dir", default_value = ".")]
    export_dir: PathBuf,

    /// Workspace to open; the first listed workspace otherwise
    workspace: Option<WorkspaceId>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct AppConfig {
    viewer: ViewerConfig,
    client: ClientConfig,
}

impl AppConfig {
    fn from_toml(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw).context("invalid configuration")?;
        config.viewer = config.viewer.sanitized();
        Ok(config)
    }

    fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {:?}", path))?;
        Self::from_toml(&raw)
    }

    fn resolve(explicit: Option<&Path>, project_dirs: &ProjectDirs) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        let path = project_dirs.config_dir().join("config.toml");
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }
}

struct RawModeGuard;

impl RawModeGuard {
    fn new() -> anyhow::Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
        let mut stdout = io::stdout();
        let _ = crossterm::execute!(stdout, cursor::Show);
    }
}

struct MouseCaptureGuard;

impl MouseCaptureGuard {
    fn new() -> anyhow::Result<Self> {
        crossterm::execute!(io::stdout(), EnableMouseCapture)?;
        Ok(Self)
    }
}

impl Drop for MouseCaptureGuard {
    fn drop(&mut self) {
        let _ = crossterm::execute!(io::stdout(), DisableMouseCapture);
    }
}

enum Completion {
    Load {
        ticket: LoadTicket,
        pages: Result<Vec<Page>>,
        polygons: Result<Vec<Polygon>>,
    },
    Tile {
        key: TileKey,
        result: Result<Option<TileImage>>,
    },
    Save {
        request: SaveRequest,
        result: Result<()>,
    },
    Export {
        workspace: WorkspaceId,
        result: Result<PathBuf>,
    },
}

struct App {
    viewer: Viewer,
    client: Arc<HttpClient>,
    tiles: TileStore<TileImage>,
    tx: UnboundedSender<Completion>,
    export_dir: PathBuf,
    notice: Option<String>,
}

impl App {
    fn open_workspace(&mut self, workspace: WorkspaceId) {
        let ticket = self.viewer.begin_load(workspace);
        self.tiles.clear();
        self.notice = Some("loading...".to_string());
        let client = Arc::clone(&self.client);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let pages = client.fetch_pages(workspace).await;
            let polygons = client.fetch_polygons(workspace).await;
            let _ = tx.send(Completion::Load {
                ticket,
                pages,
                polygons,
            });
        });
    }

    fn request_tiles(&mut self, keys: Vec<TileKey>) {
        for key in keys {
            let client = Arc::clone(&self.client);
            let tx = self.tx.clone();
            tokio::spawn(async move {
                let result = client.resolve_tile(&key).await;
                let _ = tx.send(Completion::Tile { key, result });
            });
        }
    }

    fn request_save(&self, request: SaveRequest) {
        let client = Arc::clone(&self.client);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = client.save_polygon(&request.update).await;
            let _ = tx.send(Completion::Save { request, result });
        });
    }

    fn request_export(&mut self) {
        let Some(workspace) = self.viewer.workspace() else {
            return;
        };
        self.notice = Some("exporting analysis...".to_string());
        let client = Arc::clone(&self.client);
        let tx = self.tx.clone();
        let path = self.export_dir.join(analysis_file_name(workspace));
        tokio::spawn(async move {
            let result = export_analysis(client.as_ref(), workspace, path).await;
            let _ = tx.send(Completion::Export { workspace, result });
        });
    }

    fn complete(&mut self, completion: Completion) -> bool {
        match completion {
            Completion::Load {
                ticket,
                pages,
                polygons,
            } => {
                let applied = self.viewer.finish_load(ticket, pages, polygons);
                if applied {
                    self.notice = None;
                }
                applied
            }
            Completion::Tile { key, result } => self.tiles.complete(key, result),
            Completion::Save { request, result } => {
                self.viewer.finish_save(&request, result);
                true
            }
            Completion::Export { workspace, result } => {
                self.notice = Some(match result {
                    Ok(path) => format!("analysis written to {}", path.display()),
                    Err(err) => {
                        warn!(?err, workspace, "analysis export failed");
                        format!("export failed: {err:#}")
                    }
                });
                true
            }
        }
    }

    fn drain_viewer_events(&mut self) -> bool {
        let mut redraw = false;
        for event in self.viewer.drain_events() {
            match event {
                ViewerEvent::SaveRequested(request) => {
                    self.request_save(request);
                    redraw = true;
                }
                ViewerEvent::WorkspaceLoaded(_) => {
                    self.tiles.clear();
                    redraw = true;
                }
                ViewerEvent::SaveFailed { .. }
                | ViewerEvent::Saved(_)
                | ViewerEvent::RedrawNeeded
                | ViewerEvent::SelectionChanged(_)
                | ViewerEvent::DecisionRequired(_) => redraw = true,
            }
        }
        redraw
    }

    fn status(&self, pending_input: Option<&str>) -> String {
        let mut status = self.viewer.status().to_string();
        if let Some(notice) = &self.notice {
            status.push_str(" | ");
            status.push_str(notice);
        }
        combine_status(status, pending_input)
    }
}

async fn export_analysis(
    client: &HttpClient,
    workspace: WorkspaceId,
    path: PathBuf,
) -> Result<PathBuf> {
    let analysis = client.export_analysis(workspace).await?;
    let body = serde_json::to_string_pretty(&analysis)?;
    fs::write(&path, body).with_context(|| format!("failed to write {:?}", path))?;
    info!(workspace, path = %path.display(), "analysis exported");
    Ok(path)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let project_dirs = ProjectDirs::from("net", "tilemark", "tilemark")
        .ok_or_else(|| anyhow!("unable to resolve platform data directories"))?;
    let _log_guard = init_logging(&project_dirs)?;

    let mut config = AppConfig::resolve(args.config.as_deref(), &project_dirs)?;
    if let Some(base_url) = args.base_url {
        config.client.base_url = base_url;
    }
    let client = Arc::new(HttpClient::new(&config.client)?);

    let state_dir = project_dirs.data_local_dir().join("state");
    let store: Arc<dyn StateStore> = Arc::new(FileStateStore::new(state_dir)?);
    let capacity = config.viewer.tile_cache_capacity;
    let mut viewer = Viewer::new(config.viewer, store);

    match client.list_workspaces().await {
        Ok(workspaces) => viewer.set_workspaces(workspaces),
        Err(err) => warn!(?err, "failed to list workspaces"),
    }
    let initial = args.workspace.or_else(|| viewer.adjacent_workspace(0));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut app = App {
        viewer,
        client,
        tiles: TileStore::new(capacity),
        tx,
        export_dir: args.export_dir,
        notice: None,
    };
    match initial {
        Some(workspace) => app.open_workspace(workspace),
        None => app.notice = Some("no workspaces available".to_string()),
    }

    let _raw = RawModeGuard::new()?;
    let _mouse = MouseCaptureGuard::new()?;
    let mut stdout = io::stdout();
    crossterm::execute!(stdout, cursor::Hide)?;
    let mut renderer = KittyRenderer::new(stdout);
    renderer.clear_all()?;
    let mut event_mapper = EventMapper::new();

    let result = run(&mut app, &mut renderer, &mut event_mapper, &mut rx).await;

    renderer.clear_all()?;
    if app.viewer.workspace().is_some() {
        if let Err(err) = app.viewer.persist_view() {
            warn!(?err, "failed to persist view state");
        }
    }
    result
}

enum LoopAction {
    Continue,
    ContinueRedraw,
    Quit,
}

async fn run(
    app: &mut App,
    renderer: &mut KittyRenderer<io::Stdout>,
    event_mapper: &mut EventMapper,
    rx: &mut UnboundedReceiver<Completion>,
) -> Result<()> {
    let mut dirty = true;

    loop {
        while let Ok(completion) = rx.try_recv() {
            dirty |= app.complete(completion);
        }
        dirty |= app.drain_viewer_events();

        let mode = if app.viewer.phase() == EditPhase::AwaitingDecision {
            InputMode::Decision
        } else {
            InputMode::Normal
        };
        event_mapper.set_mode(mode);

        if dirty {
            redraw(renderer, app, event_mapper)?;
            dirty = app.drain_viewer_events();
        }

        // Yield so spawned requests progress between terminal polls.
        tokio::task::yield_now().await;
        if event::poll(Duration::from_millis(30))? {
            let ev = event::read()?;
            let ui_event = event_mapper.map_event(ev);
            match handle_event(ui_event, app)? {
                LoopAction::ContinueRedraw => dirty = true,
                LoopAction::Continue => {}
                LoopAction::Quit => break,
            }
            if event_mapper.pending_input().is_some() {
                let status = app.status(event_mapper.pending_input().as_deref());
                draw_status_line(renderer, &status)?;
            }
        }
    }
    Ok(())
}

fn handle_event(event: UiEvent, app: &mut App) -> Result<LoopAction> {
    match event {
        UiEvent::Command(command) => {
            if let Err(err) = app.viewer.apply(command) {
                warn!(?err, "command failed");
                app.notice = Some(format!("{err:#}"));
            }
            Ok(LoopAction::ContinueRedraw)
        }
        UiEvent::Input(input) => {
            app.viewer.handle_input(input);
            Ok(LoopAction::Continue)
        }
        UiEvent::NextWorkspace => Ok(cycle_workspace(app, 1)),
        UiEvent::PrevWorkspace => Ok(cycle_workspace(app, -1)),
        UiEvent::ExportAnalysis => {
            app.request_export();
            Ok(LoopAction::ContinueRedraw)
        }
        UiEvent::Resize { .. } => Ok(LoopAction::ContinueRedraw),
        UiEvent::Quit => Ok(LoopAction::Quit),
        UiEvent::None => Ok(LoopAction::Continue),
    }
}

fn cycle_workspace(app: &mut App, step: isize) -> LoopAction {
    match app.viewer.adjacent_workspace(step) {
        Some(workspace) if Some(workspace) != app.viewer.workspace() => {
            app.open_workspace(workspace);
            LoopAction::ContinueRedraw
        }
        _ => LoopAction::Continue,
    }
}

struct Layout {
    grid: CellGrid,
    columns: u16,
    stage_rows: u16,
    stage: StageSize,
}

impl Layout {
    fn measure() -> Result<Self> {
        let window = terminal::window_size()?;
        let columns = window.columns.max(1);
        let rows = window.rows.max(1);
        let grid = CellGrid::from_window(window.width, window.height, columns, rows);
        let stage_rows = rows.saturating_sub(1).max(1);
        let stage = StageSize::new(
            (f64::from(columns) * grid.cell_width).floor(),
            (f64::from(stage_rows) * grid.cell_height).floor(),
        );
        Ok(Self {
            grid,
            columns,
            stage_rows,
            stage,
        })
    }
}

fn redraw(
    renderer: &mut KittyRenderer<io::Stdout>,
    app: &mut App,
    event_mapper: &mut EventMapper,
) -> Result<()> {
    let layout = Layout::measure()?;
    event_mapper.set_grid(layout.grid);
    app.viewer.apply(Command::Resize(layout.stage))?;

    let frame = app.viewer.frame();
    let visible: Vec<_> = frame.tiles.iter().map(|view| view.tile).collect();
    let requests = app.tiles.sync(&visible);
    app.request_tiles(requests);

    let mut image = canvas::blank(layout.stage.width as u32, layout.stage.height as u32);
    canvas::compose(&mut image, &frame, |key| app.tiles.get(key));

    renderer.begin_sync_update()?;
    {
        let mut writer = renderer.writer();
        crossterm::execute!(&mut writer, cursor::MoveTo(0, 0))?;
    }
    renderer.draw(
        &image,
        DrawParams::clamped(u32::from(layout.columns), u32::from(layout.stage_rows)),
    )?;
    let status = app.status(event_mapper.pending_input().as_deref());
    draw_status_line(renderer, &status)?;
    renderer.end_sync_update()?;
    Ok(())
}

fn combine_status(mut base: String, pending_input: Option<&str>) -> String {
    if let Some(pending) = pending_input.filter(|s| !s.is_empty()) {
        base.push_str(" | ");
        base.push_str(pending);
    }
    base
}

fn draw_status_line(renderer: &mut KittyRenderer<io::Stdout>, status: &str) -> Result<()> {
    let window = terminal::window_size()?;
    let total_rows = u32::from(window.rows).max(1);
    let status_row = total_rows.saturating_sub(1);
    let columns = usize::from(window.columns.max(1));
    let mut writer = renderer.writer();
    crossterm::execute!(
        &mut writer,
        cursor::MoveTo(0, status_row as u16),
        Clear(ClearType::CurrentLine)
    )?;
    let line: String = status.chars().take(columns).collect();
    write_status_line(&mut writer, &line)?;
    Ok(())
}

fn init_logging(project_dirs: &ProjectDirs) -> Result<WorkerGuard> {
    let log_dir = project_dirs.data_local_dir().join("logs");
    fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::never(log_dir, "tilemark.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // The terminal belongs to the viewer, so logs only go to the file.
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_sections_are_optional() {
        let config = AppConfig::from_toml(
            r#"
            [viewer]
            zoom_step = 1.1

            [client]
            base_url = "http://tiles.local:9000"
            "#,
        )
        .unwrap();
        assert_eq!(config.viewer.zoom_step, 1.1);
        assert_eq!(config.viewer.click_threshold, 2.0);
        assert_eq!(config.client.base_url, "http://tiles.local:9000");
        assert_eq!(config.client.timeout_secs, 30);

        assert_eq!(AppConfig::from_toml("").unwrap(), AppConfig::default());
    }

    #[test]
    fn invalid_viewer_values_fall_back() {
        let config = AppConfig::from_toml("[viewer]\nzoom_step = 0.5\n").unwrap();
        assert_eq!(config.viewer.zoom_step, ViewerConfig::default().zoom_step);
    }

    #[test]
    fn explicit_config_file_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tilemark.toml");
        fs::write(&path, "[client]\ntimeout_secs = 5\n").unwrap();
        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.client.timeout_secs, 5);

        assert!(AppConfig::load(&dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn pending_digits_follow_status() {
        assert_eq!(combine_status("workspace 1".into(), Some("12")), "workspace 1 | 12");
        assert_eq!(combine_status("workspace 1".into(), Some("")), "workspace 1");
        assert_eq!(combine_status("workspace 1".into(), None), "workspace 1");
    }

    #[test]
    fn args_parse_workspace_and_overrides() {
        let args = Args::parse_from(["tilemark", "--base-url", "http://h:1", "7"]);
        assert_eq!(args.workspace, Some(7));
        assert_eq!(args.base_url.as_deref(), Some("http://h:1"));
        assert_eq!(args.export_dir, PathBuf::from("."));
    }
}
