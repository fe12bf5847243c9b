//! CLI entry point for running a transactional Raft node with an interactive TUI.
//!
//! The output pane shows command results interleaved with the node's own
//! tracing output (role changes, rejected entries, lock purges), so log lines
//! never land on top of what is being typed.
//!
//! Start a 3-node cluster:
//! ```bash
//! # Terminal 1 (node 1)
//! cargo run --bin node -- \
//!   --id 1 --listen 127.0.0.1:7101 \
//!   --peer 1=127.0.0.1:7101,2=127.0.0.1:7102,3=127.0.0.1:7103
//!
//! # Terminals 2 and 3: same peers, --id 2/3 and --listen on 7102/7103
//! ```
//!
//! Set `RUST_LOG=debug` to watch entries being applied.

use std::io::{self, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use clap::{Parser, ValueHint};
use crossbeam_channel::{unbounded, Receiver, Sender};
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use raft::StateRole;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::widgets::{Block, Borders, List, ListItem, Paragraph};
use ratatui::Terminal;
use tracing_subscriber::fmt::MakeWriter;

use txn_replication::config::{parse_peers, NodeConfig};
use txn_replication::error::ApplyError;
use txn_replication::protocol::{ConsoleCommand, HELP_TEXT};
use txn_replication::runtime::{spawn_node, NodeHandle};

/// How often the status bar asks the worker for role, term and leader.
const STATUS_REFRESH: Duration = Duration::from_millis(50);

/// Command-line arguments for the node.
#[derive(Parser, Debug)]
#[command(author, version, about = "Run a transactional Raft node with an interactive TUI")]
struct Args {
    /// Numeric node ID (must match one entry in --peer)
    #[arg(long)]
    id: u64,

    /// Address this node should listen on for Raft messages, e.g. 127.0.0.1:7101
    #[arg(long, value_hint = ValueHint::Hostname)]
    listen: String,

    /// Comma-separated peer map: id=addr,id=addr,... (must include self)
    #[arg(long, value_delimiter = ',', value_hint = ValueHint::Other)]
    peer: Vec<String>,

    /// Snapshot file to load into the store before joining
    #[arg(long, value_hint = ValueHint::FilePath)]
    restore: Option<PathBuf>,

    /// Lock TTL in seconds for TXN commands that do not give one
    #[arg(long, default_value_t = 30)]
    txn_ttl: u64,
}

/// Tracing writer that forwards each formatted line to the output pane.
#[derive(Clone)]
struct LogPaneWriter {
    tx: Sender<String>,
}

impl Write for LogPaneWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for line in String::from_utf8_lossy(buf).lines() {
            if !line.trim().is_empty() {
                // The pane may already be gone during shutdown.
                let _ = self.tx.send(line.to_string());
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogPaneWriter {
    type Writer = LogPaneWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Routes tracing output into the TUI instead of the terminal.
fn init_tracing() -> Receiver<String> {
    use tracing_subscriber::{fmt, EnvFilter};

    let (tx, rx) = unbounded();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(LogPaneWriter { tx })
        .try_init();
    rx
}

/// Application state for the TUI.
struct App {
    node_id: u64,
    /// Current input being typed
    input: String,
    /// Cursor position in input, in characters
    cursor_position: usize,
    /// Log lines and command output
    output_lines: Vec<String>,
    /// Lines scrolled back from the newest output; 0 follows the tail
    scroll_back: usize,
    handle: NodeHandle,
    log_rx: Receiver<String>,
    /// Lock TTL for TXN commands without an explicit one
    default_ttl: u64,
    role: StateRole,
    leader_id: u64,
    term: u64,
    last_status_update: Instant,
    should_quit: bool,
}

impl App {
    fn new(node_id: u64, handle: NodeHandle, log_rx: Receiver<String>, default_ttl: u64) -> Self {
        Self {
            node_id,
            input: String::new(),
            cursor_position: 0,
            output_lines: vec![
                format!("Node {node_id} ready. Type HELP (or h) for commands."),
                "Keyboard: Enter=submit, Ctrl-C/ESC=exit, Up/Down=scroll output".to_string(),
                String::new(),
            ],
            scroll_back: 0,
            handle,
            log_rx,
            default_ttl,
            role: StateRole::Follower,
            leader_id: 0,
            term: 0,
            last_status_update: Instant::now(),
            should_quit: false,
        }
    }

    /// Moves pending tracing lines into the output pane (non-blocking).
    fn drain_logs(&mut self) {
        while let Ok(line) = self.log_rx.try_recv() {
            self.output_lines.push(line);
        }
    }

    fn update_status(&mut self) {
        if let Ok(status) = self.handle.status() {
            self.role = status.role;
            self.leader_id = status.leader_id;
            self.term = status.term;
            self.last_status_update = Instant::now();
        }
    }

    fn handle_key(&mut self, code: KeyCode) -> Result<()> {
        match code {
            KeyCode::Char(c) => {
                let at = byte_offset(&self.input, self.cursor_position);
                self.input.insert(at, c);
                self.cursor_position += 1;
            }
            KeyCode::Backspace => {
                if self.cursor_position > 0 {
                    self.cursor_position -= 1;
                    let at = byte_offset(&self.input, self.cursor_position);
                    self.input.remove(at);
                }
            }
            KeyCode::Left => {
                self.cursor_position = self.cursor_position.saturating_sub(1);
            }
            KeyCode::Right => {
                if self.cursor_position < self.input.chars().count() {
                    self.cursor_position += 1;
                }
            }
            KeyCode::Up => {
                self.scroll_back = self.scroll_back.saturating_add(1);
            }
            KeyCode::Down => {
                self.scroll_back = self.scroll_back.saturating_sub(1);
            }
            KeyCode::Enter => self.execute_command()?,
            KeyCode::Esc => self.should_quit = true,
            _ => {}
        }
        Ok(())
    }

    /// Executes the current input as a command.
    fn execute_command(&mut self) -> Result<()> {
        let input = self.input.trim().to_string();
        self.input.clear();
        self.cursor_position = 0;
        if input.is_empty() {
            return Ok(());
        }

        self.output_lines.push(format!("> {input}"));
        self.scroll_back = 0;

        match ConsoleCommand::parse(&input) {
            Ok(ConsoleCommand::Exit) => {
                self.output_lines.push("Shutting down...".to_string());
                self.handle.shutdown()?;
                self.should_quit = true;
            }
            Ok(cmd) => {
                match run_command(&self.handle, cmd, self.default_ttl) {
                    Ok(lines) => self.output_lines.extend(lines),
                    Err(err) => self.output_lines.push(format!("ERROR: {}", describe(&err))),
                }
            }
            Err(err) => self.output_lines.push(format!("ERROR: {err}")),
        }
        Ok(())
    }
}

/// Runs one command against the node and returns the lines to print.
fn run_command(handle: &NodeHandle, cmd: ConsoleCommand, default_ttl: u64) -> Result<Vec<String>> {
    let mut out = Vec::new();
    match cmd {
        ConsoleCommand::Put { key, value } => {
            handle.put(key.as_bytes(), value.as_bytes())?;
            out.push(format!("OK: {key} = {value}"));
        }
        ConsoleCommand::Get { key } => match handle.get(key.as_bytes())? {
            Some(value) => out.push(format!("{key} = {}", String::from_utf8_lossy(&value))),
            None => out.push(format!("{key} not found")),
        },
        ConsoleCommand::Del { key } => {
            handle.delete(key.as_bytes())?;
            out.push(format!("OK: deleted {key}"));
        }
        ConsoleCommand::Txn { ttl, mutations } => {
            let count = mutations.len();
            handle.transact(mutations, ttl.unwrap_or(default_ttl))?;
            out.push(format!("OK: committed {count} mutation(s)"));
        }
        ConsoleCommand::Abort { keys } => {
            let count = keys.len();
            handle.abort(keys)?;
            out.push(format!("OK: released {count} lock(s)"));
        }
        ConsoleCommand::Snapshot { path } => {
            let bytes = handle.snapshot(path.clone())?;
            out.push(format!("OK: wrote {bytes} bytes to {}", path.display()));
        }
        ConsoleCommand::Status => {
            let status = handle.status()?;
            out.push(format!(
                "Node {} | Term: {} | Role: {:?} | Leader: {}",
                status.node_id, status.term, status.role, status.leader_id
            ));
            if status.store.is_empty() {
                out.push("  Store: empty".to_string());
            } else {
                for (k, v) in &status.store {
                    out.push(format!(
                        "  {} = {}",
                        String::from_utf8_lossy(k),
                        String::from_utf8_lossy(v)
                    ));
                }
            }
            if !status.locked.is_empty() {
                let locked: Vec<_> = status.locked.iter().map(|k| String::from_utf8_lossy(k)).collect();
                out.push(format!("  Locked: {}", locked.join(", ")));
            }
        }
        ConsoleCommand::Campaign => out.push(handle.campaign()?),
        ConsoleCommand::Help => out.extend(HELP_TEXT.lines().map(str::to_string)),
        ConsoleCommand::Exit => {}
    }
    Ok(out)
}

/// Adds the apply-error kind when the failure came from a committed entry.
fn describe(err: &anyhow::Error) -> String {
    match err.downcast_ref::<ApplyError>() {
        Some(apply) => format!("{err:#} [{:?}]", apply.kind()),
        None => format!("{err:#}"),
    }
}

fn byte_offset(s: &str, chars: usize) -> usize {
    s.char_indices().nth(chars).map_or(s.len(), |(i, _)| i)
}

/// First line to show so the pane ends `scroll_back` lines above the newest.
fn first_visible(total: usize, height: usize, scroll_back: usize) -> usize {
    let max_start = total.saturating_sub(height);
    max_start.saturating_sub(scroll_back)
}

fn render_ui(frame: &mut ratatui::Frame, app: &App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Min(5),    // Output window
            Constraint::Length(3), // Input window
            Constraint::Length(1), // Status bar
        ])
        .split(frame.area());

    // Borders take one line at the top and one at the bottom.
    let output_height = chunks[0].height.saturating_sub(2) as usize;
    let total_lines = app.output_lines.len();
    let start = first_visible(total_lines, output_height, app.scroll_back);
    let visible_lines: Vec<ListItem> = app
        .output_lines
        .iter()
        .skip(start)
        .take(output_height)
        .map(|line| ListItem::new(line.as_str()))
        .collect();

    let output_block = Block::default()
        .borders(Borders::ALL)
        .title(format!(" Output (↑/↓ to scroll, {total_lines} lines) "));
    frame.render_widget(List::new(visible_lines).block(output_block), chunks[0]);

    let input_block = Block::default()
        .borders(Borders::ALL)
        .title(" Input (Enter to submit, ESC/Ctrl-C to quit) ");
    frame.render_widget(Paragraph::new(app.input.as_str()).block(input_block), chunks[1]);

    frame.set_cursor_position((
        chunks[1].x + app.cursor_position as u16 + 1,
        chunks[1].y + 1,
    ));

    let status_text = format!(
        " Node {} | Term: {} | Role: {:?} | Leader: {} ",
        app.node_id, app.term, app.role, app.leader_id
    );
    let status_style = match app.role {
        StateRole::Leader => Style::default().fg(Color::Green).add_modifier(Modifier::BOLD),
        StateRole::Candidate => Style::default().fg(Color::Yellow),
        _ => Style::default().fg(Color::White),
    };
    frame.render_widget(Paragraph::new(status_text).style(status_style), chunks[2]);
}

fn main() -> Result<()> {
    let log_rx = init_tracing();

    let args = Args::parse();
    let peers = parse_peers(&args.peer)?;

    if peers.get(&args.id).map(String::as_str) != Some(args.listen.as_str()) {
        return Err(anyhow!(
            "self id {} must map to listen addr {} via --peer entries",
            args.id,
            args.listen
        ));
    }

    let mut config = NodeConfig::new(args.id, args.listen.clone(), peers);
    config.restore_from = args.restore;
    let handle = spawn_node(config)?;

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout))?;

    let mut app = App::new(args.id, handle, log_rx, args.txn_ttl);
    app.update_status();

    let result = run_tui(&mut terminal, &mut app);

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    // ESC and Ctrl-C leave without EXIT; the worker may already be gone.
    let _ = app.handle.shutdown();
    result
}

fn run_tui(terminal: &mut Terminal<CrosstermBackend<io::Stdout>>, app: &mut App) -> Result<()> {
    loop {
        app.drain_logs();
        terminal.draw(|frame| render_ui(frame, app))?;

        if event::poll(Duration::from_millis(100))? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    if key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL) {
                        app.should_quit = true;
                    } else {
                        app.handle_key(key.code)?;
                    }
                }
            }
        }

        if app.last_status_update.elapsed() >= STATUS_REFRESH {
            app.update_status();
        }

        if app.should_quit {
            break;
        }
    }
    Ok(())
}
