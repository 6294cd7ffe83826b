mod client;
mod config;
mod controller;
mod liveness;
#[cfg(test)]
mod test_support;

use anyhow::Result;
use client::GatewayClient;
use config::ClientConfig;
use controller::{ChatController, Command, ControllerView, Phase};
use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use liveness::{LivenessProber, ServerStatus};
use ratatui::{
    backend::{Backend, CrosstermBackend},
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph, Wrap},
    Frame, Terminal,
};
use std::io;
use std::sync::Arc;
use taxpal_shared::MessageRole;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::info;

struct App {
    view: ControllerView,
    status: ServerStatus,
    input: String,
    cursor_position: usize,
    scroll_offset: usize,
}

impl App {
    fn new(view: ControllerView, status: ServerStatus) -> Self {
        Self {
            view,
            status,
            input: String::new(),
            cursor_position: 0,
            scroll_offset: 0,
        }
    }

    fn can_submit(&self) -> bool {
        self.view.can_submit(self.status)
    }

    fn take_input(&mut self) -> Option<String> {
        if self.input.trim().is_empty() || !self.can_submit() {
            return None;
        }
        self.cursor_position = 0;
        self.scroll_offset = 0;
        Some(std::mem::take(&mut self.input))
    }

    fn move_cursor_left(&mut self) {
        if let Some(c) = self.input[..self.cursor_position].chars().next_back() {
            self.cursor_position -= c.len_utf8();
        }
    }

    fn move_cursor_right(&mut self) {
        if let Some(c) = self.input[self.cursor_position..].chars().next() {
            self.cursor_position += c.len_utf8();
        }
    }

    fn insert_char(&mut self, c: char) {
        self.input.insert(self.cursor_position, c);
        self.cursor_position += c.len_utf8();
    }

    fn delete_char(&mut self) {
        if let Some(c) = self.input[..self.cursor_position].chars().next_back() {
            self.cursor_position -= c.len_utf8();
            self.input.remove(self.cursor_position);
        }
    }

    fn scroll_up(&mut self, amount: usize) {
        self.scroll_offset = self.scroll_offset.saturating_add(amount);
    }

    fn scroll_down(&mut self, amount: usize) {
        self.scroll_offset = self.scroll_offset.saturating_sub(amount);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    // Log to a file so the TUI stays intact
    if let Ok(file) = std::fs::File::create("taxpal-cli.log") {
        tracing_subscriber::fmt()
            .with_writer(file)
            .with_ansi(false)
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "taxpal=info".into()),
            )
            .init();
    }

    let config = ClientConfig::from_env()?;
    info!(gateway = %config.gateway_url, "Starting taxpal");

    let gateway = GatewayClient::new(
        config.gateway_url.clone(),
        config.chat_timeout,
        config.probe_timeout,
    );
    let prober = Arc::new(LivenessProber::new(gateway.clone()));
    let (chat, events) = ChatController::new(gateway, Arc::clone(&prober), config.resend);
    let view_rx = chat.subscribe_view();
    let status_rx = prober.subscribe();

    let shutdown = CancellationToken::new();
    let monitor = prober.spawn_monitor(config.probe_interval, shutdown.clone());
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let worker = controller::spawn(chat, events, command_rx, shutdown.clone());

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let (ui_tx, ui_rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        while let Ok(event) = event::read() {
            if ui_tx.send(event).is_err() {
                break;
            }
        }
    });

    let res = run_app(&mut terminal, command_tx, view_rx, status_rx, ui_rx).await;

    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;

    shutdown.cancel();
    let _ = tokio::join!(monitor, worker);
    info!("taxpal stopped");

    if let Err(err) = res {
        println!("{err:?}");
    }

    Ok(())
}

async fn run_app<B: Backend>(
    terminal: &mut Terminal<B>,
    commands: mpsc::UnboundedSender<Command>,
    mut view_rx: watch::Receiver<ControllerView>,
    mut status_rx: watch::Receiver<ServerStatus>,
    mut ui_rx: mpsc::UnboundedReceiver<Event>,
) -> Result<()> {
    let mut app = App::new(view_rx.borrow().clone(), *status_rx.borrow());

    loop {
        terminal.draw(|f| ui(f, &app))?;

        tokio::select! {
            Ok(()) = view_rx.changed() => {
                let view = view_rx.borrow_and_update().clone();
                if view.conversation.len() != app.view.conversation.len() {
                    app.scroll_offset = 0;
                }
                app.view = view;
            }
            Ok(()) = status_rx.changed() => {
                app.status = *status_rx.borrow_and_update();
            }
            event = ui_rx.recv() => {
                let Some(event) = event else { return Ok(()) };
                match event {
                    Event::Key(key) if key.kind == KeyEventKind::Press => {
                        let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
                        match key.code {
                            KeyCode::Char('q') | KeyCode::Char('c') if ctrl => return Ok(()),
                            KeyCode::Char('r') if ctrl => {
                                if app.view.has_pending && app.view.phase != Phase::Sending {
                                    commands.send(Command::Retry)?;
                                }
                            }
                            KeyCode::Char('l') if ctrl => {
                                app.scroll_offset = 0;
                                commands.send(Command::Clear)?;
                            }
                            KeyCode::Char('p') if ctrl => {
                                commands.send(Command::Probe)?;
                            }
                            KeyCode::Char(c) => app.insert_char(c),
                            KeyCode::Backspace => app.delete_char(),
                            KeyCode::Left => app.move_cursor_left(),
                            KeyCode::Right => app.move_cursor_right(),
                            KeyCode::Enter => {
                                if let Some(text) = app.take_input() {
                                    commands.send(Command::Submit(text))?;
                                }
                            }
                            KeyCode::Up => app.scroll_up(1),
                            KeyCode::Down => app.scroll_down(1),
                            KeyCode::PageUp => app.scroll_up(10),
                            KeyCode::PageDown => app.scroll_down(10),
                            KeyCode::Home => app.cursor_position = 0,
                            KeyCode::End => app.cursor_position = app.input.len(),
                            _ => {}
                        }
                    }
                    Event::Mouse(mouse) => match mouse.kind {
                        event::MouseEventKind::ScrollUp => app.scroll_up(3),
                        event::MouseEventKind::ScrollDown => app.scroll_down(3),
                        _ => {}
                    },
                    _ => {}
                }
            }
        }
    }
}

fn ui(f: &mut Frame, app: &App) {
    let banner = banner_lines(app);

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(1),
            Constraint::Length(banner.len() as u16),
            Constraint::Min(1),
            Constraint::Length(3),
        ])
        .split(f.area());

    render_status(f, app, chunks[0]);
    f.render_widget(
        Paragraph::new(banner).wrap(Wrap { trim: true }),
        chunks[1],
    );
    render_chat(f, app, chunks[2]);
    render_input(f, app, chunks[3]);
}

fn render_status(f: &mut Frame, app: &App, area: Rect) {
    let color = match app.status {
        ServerStatus::Online => Color::Green,
        ServerStatus::Checking => Color::Yellow,
        ServerStatus::Offline => Color::Red,
    };
    let line = Line::from(vec![
        Span::styled("Tax Assistant ", Style::default().add_modifier(Modifier::BOLD)),
        Span::styled(format!("● {}", app.status.label()), Style::default().fg(color)),
    ]);
    f.render_widget(Paragraph::new(line), area);
}

fn banner_lines(app: &App) -> Vec<Line<'static>> {
    let mut lines = Vec::new();
    if app.status == ServerStatus::Offline {
        lines.push(Line::from(Span::styled(
            "Server is offline. Messages cannot be sent until it is back (Ctrl-P to re-check).",
            Style::default().fg(Color::Red),
        )));
    }
    if app.view.phase == Phase::RateLimited {
        lines.push(Line::from(Span::styled(
            format!(
                "Rate limited. Retrying automatically... (attempt {})",
                app.view.retry.retry_count
            ),
            Style::default().fg(Color::Yellow),
        )));
    }
    if let Some(error) = &app.view.error {
        let hint = if app.view.has_pending { " (Ctrl-R to retry)" } else { "" };
        lines.push(Line::from(Span::styled(
            format!("Error: {error}{hint}"),
            Style::default().fg(Color::LightRed),
        )));
    }
    lines
}

fn render_chat(f: &mut Frame, app: &App, area: Rect) {
    let mut all_lines: Vec<Line> = Vec::new();

    if app.view.conversation.is_empty() {
        all_lines.push(Line::from(Span::styled(
            "Ask a tax question to get started.",
            Style::default().fg(Color::DarkGray),
        )));
    }

    for msg in &app.view.conversation {
        let (prefix, style) = match msg.role {
            MessageRole::User => ("You", Style::default().fg(Color::Cyan)),
            MessageRole::Assistant => ("Assistant", Style::default().fg(Color::Green)),
        };

        all_lines.push(Line::from(Span::styled(
            format!("{prefix}:"),
            style.add_modifier(Modifier::BOLD),
        )));
        for line in msg.content.lines() {
            all_lines.push(Line::from(Span::styled(line, style)));
        }
        all_lines.push(Line::from(""));
    }

    if app.view.phase == Phase::Sending {
        all_lines.push(Line::from(Span::styled(
            "Assistant is typing ●●●",
            Style::default().fg(Color::DarkGray),
        )));
    }

    let total_lines = all_lines.len();
    let visible_height = area.height as usize;
    let start_line = if total_lines > visible_height {
        let max_scroll = total_lines - visible_height;
        max_scroll - app.scroll_offset.min(max_scroll)
    } else {
        0
    };
    let end_line = (start_line + visible_height).min(total_lines);

    let chat = Paragraph::new(all_lines[start_line..end_line].to_vec())
        .block(Block::default().borders(Borders::NONE))
        .wrap(Wrap { trim: false });
    f.render_widget(chat, area);
}

fn render_input(f: &mut Frame, app: &App, area: Rect) {
    let enabled = app.can_submit();
    let placeholder = match (app.status, app.view.phase) {
        (ServerStatus::Offline, _) => "Server offline...",
        (_, Phase::Sending) => "Waiting for a reply...",
        (_, Phase::RateLimited) => "Waiting to retry...",
        _ => "Ask a tax question...",
    };

    let (text, style) = if app.input.is_empty() {
        (placeholder, Style::default().fg(Color::DarkGray))
    } else if enabled {
        (app.input.as_str(), Style::default())
    } else {
        (app.input.as_str(), Style::default().fg(Color::DarkGray))
    };

    let border = if enabled { Color::White } else { Color::DarkGray };
    let input = Paragraph::new(text)
        .style(style)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title("Enter send · Ctrl-R retry · Ctrl-L clear · Ctrl-P check · Ctrl-Q quit")
                .border_style(Style::default().fg(border)),
        )
        .wrap(Wrap { trim: true });
    f.render_widget(input, area);

    let cursor_x = area.x + app.input[..app.cursor_position].chars().count() as u16 + 1;
    f.set_cursor_position((cursor_x.min(area.x + area.width.saturating_sub(2)), area.y + 1));
}
