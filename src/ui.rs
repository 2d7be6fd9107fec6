// Terminal control panel (ratatui + crossterm)
//
// Arrow keys are the d-pad. Where the terminal reports key releases
// (kitty keyboard protocol) a release clears the direction; elsewhere each
// press replaces the previous one and Space releases everything.

use crate::app::App;
use crate::controls::Direction;
use crate::link::Affordance;
use crate::logging::set_stderr_enabled;
use crossterm::{
    event::{
        DisableFocusChange, EnableFocusChange, Event, EventStream, KeyCode, KeyEvent,
        KeyEventKind, KeyModifiers, KeyboardEnhancementFlags, PopKeyboardEnhancementFlags,
        PushKeyboardEnhancementFlags,
    },
    execute,
    terminal::{
        disable_raw_mode, enable_raw_mode, supports_keyboard_enhancement, EnterAlternateScreen,
        LeaveAlternateScreen,
    },
};
use futures::StreamExt;
use ratatui::{
    backend::CrosstermBackend,
    layout::{Alignment, Constraint, Direction as Axis, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Clear, Gauge, List, ListItem, Paragraph, Wrap},
    Frame, Terminal,
};
use std::io;
use std::path::PathBuf;
use std::time::Duration;

/// Redraw interval so log lines from background jobs show up.
const TICK: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq)]
enum Prompt {
    Rename,
    Flash,
}

impl Prompt {
    fn title(&self) -> &str {
        match self {
            Prompt::Rename => "New robot name",
            Prompt::Flash => "Firmware image (.bin)",
        }
    }
}

struct Panel {
    prompt: Option<(Prompt, String)>,
    /// Terminal reports key releases.
    releases: bool,
    quit: bool,
}

/// Everything the draw pass needs, gathered before the frame.
struct View {
    affordance: Affordance,
    active: Vec<Direction>,
    speed: u16,
    speed_ratio: f64,
    lines: Vec<String>,
    alert: Option<String>,
    cable_busy: bool,
}

async fn snapshot(app: &App) -> View {
    View {
        affordance: app.link().affordance().await,
        active: Direction::ALL
            .into_iter()
            .filter(|d| app.dispatcher.is_active(*d))
            .collect(),
        speed: app.dispatcher.speed().value(),
        speed_ratio: app.dispatcher.speed().ratio(),
        lines: app.console.lines(),
        alert: app.console.pending_alert(),
        cable_busy: app.cable_busy(),
    }
}

/// Take over the terminal and run the panel until the user quits.
pub async fn run(mut app: App) -> io::Result<()> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableFocusChange)?;

    let releases = supports_keyboard_enhancement().unwrap_or(false);
    if releases {
        execute!(
            stdout,
            PushKeyboardEnhancementFlags(KeyboardEnhancementFlags::REPORT_EVENT_TYPES)
        )?;
    }

    // The panel owns the screen; tlog! keeps writing to the log file
    set_stderr_enabled(false);

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;
    let mut panel = Panel {
        prompt: None,
        releases,
        quit: false,
    };
    let res = run_panel(&mut terminal, &mut app, &mut panel).await;
    app.shutdown().await;

    set_stderr_enabled(true);
    if releases {
        let _ = execute!(terminal.backend_mut(), PopKeyboardEnhancementFlags);
    }
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen, DisableFocusChange)?;
    terminal.show_cursor()?;

    res
}

async fn run_panel<B: ratatui::backend::Backend>(
    terminal: &mut Terminal<B>,
    app: &mut App,
    panel: &mut Panel,
) -> io::Result<()> {
    let mut events = EventStream::new();
    let mut tick = tokio::time::interval(TICK);

    app.console.log("Ready. Press 'c' to connect.");

    while !panel.quit {
        let view = snapshot(app).await;
        terminal.draw(|f| draw(f, &view, panel))?;

        tokio::select! {
            _ = tick.tick() => {}
            event = events.next() => match event {
                Some(Ok(Event::Key(key))) => handle_key(app, panel, key).await,
                Some(Ok(Event::FocusLost)) => app.dispatcher.release_all_visual(),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e),
                None => break,
            },
        }
    }

    Ok(())
}

fn direction_for(code: KeyCode) -> Option<Direction> {
    match code {
        KeyCode::Up => Some(Direction::Forward),
        KeyCode::Down => Some(Direction::Backward),
        KeyCode::Left => Some(Direction::Left),
        KeyCode::Right => Some(Direction::Right),
        _ => None,
    }
}

async fn handle_key(app: &mut App, panel: &mut Panel, key: KeyEvent) {
    if key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL) {
        panel.quit = true;
        return;
    }

    if let Some(direction) = direction_for(key.code) {
        if panel.prompt.is_none() && app.console.pending_alert().is_none() {
            handle_direction(app, panel, direction, key.kind).await;
        }
        return;
    }

    if key.kind == KeyEventKind::Release {
        return;
    }

    if app.console.pending_alert().is_some() {
        if matches!(key.code, KeyCode::Enter | KeyCode::Esc) {
            app.console.take_alert();
        }
        return;
    }

    if panel.prompt.is_some() {
        handle_prompt(app, panel, key.code);
        return;
    }

    match key.code {
        KeyCode::Char('q') | KeyCode::Esc => panel.quit = true,
        KeyCode::Char('c') => {
            if app.link().affordance().await.enabled() {
                app.connect_clicked();
            }
        }
        KeyCode::Char('d') => {
            app.disconnect_clicked();
        }
        KeyCode::Char('n') => panel.prompt = Some((Prompt::Rename, String::new())),
        KeyCode::Char('f') => {
            let current = app
                .firmware
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            panel.prompt = Some((Prompt::Flash, current));
        }
        KeyCode::Char('+') | KeyCode::Char('=') => {
            app.dispatcher.slider_nudge(1);
        }
        KeyCode::Char('-') => {
            app.dispatcher.slider_nudge(-1);
        }
        KeyCode::Enter => app.dispatcher.slider_commit().await,
        KeyCode::Char(' ') => app.release_all().await,
        _ => {}
    }
}

async fn handle_direction(app: &mut App, panel: &Panel, direction: Direction, kind: KeyEventKind) {
    match kind {
        KeyEventKind::Press if panel.releases => {
            app.press(direction).await;
        }
        KeyEventKind::Press => {
            // No release events: the newest press wins, and auto-repeat of
            // the held key arrives as more presses of the same direction
            let held: Vec<Direction> = Direction::ALL
                .into_iter()
                .filter(|d| app.dispatcher.is_active(*d))
                .collect();
            if held == [direction] {
                return;
            }
            app.release_all().await;
            app.press(direction).await;
        }
        KeyEventKind::Release => app.release(direction).await,
        KeyEventKind::Repeat => {}
    }
}

fn handle_prompt(app: &mut App, panel: &mut Panel, key: KeyCode) {
    let Some((prompt, input)) = panel.prompt.as_mut() else {
        return;
    };
    match key {
        KeyCode::Char(c) => input.push(c),
        KeyCode::Backspace => {
            input.pop();
        }
        KeyCode::Esc => panel.prompt = None,
        KeyCode::Enter => {
            let text = input.clone();
            let prompt = prompt.clone();
            panel.prompt = None;
            match prompt {
                Prompt::Rename => {
                    app.rename_clicked(text);
                }
                Prompt::Flash => {
                    let image = Some(text.trim())
                        .filter(|t| !t.is_empty())
                        .map(PathBuf::from);
                    app.flash_clicked(image);
                }
            }
        }
        _ => {}
    }
}

// ============================================================================
// Drawing
// ============================================================================

fn draw(f: &mut Frame, view: &View, panel: &Panel) {
    let chunks = Layout::default()
        .direction(Axis::Vertical)
        .margin(1)
        .constraints([
            Constraint::Length(3),
            Constraint::Length(7),
            Constraint::Min(5),
            Constraint::Length(3),
        ])
        .split(f.area());

    let title = Paragraph::new("Robot Control Panel")
        .style(Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD))
        .alignment(Alignment::Center)
        .block(Block::default().borders(Borders::ALL));
    f.render_widget(title, chunks[0]);

    let controls = Layout::default()
        .direction(Axis::Horizontal)
        .constraints([
            Constraint::Percentage(35),
            Constraint::Percentage(30),
            Constraint::Percentage(35),
        ])
        .split(chunks[1]);
    draw_connection(f, view, controls[0]);
    draw_dpad(f, view, controls[1]);
    draw_speed(f, view, controls[2]);

    draw_log(f, view, chunks[2]);

    let help = Paragraph::new(
        "c connect  d disconnect  arrows drive  +/- speed  Enter send speed  n rename  f flash  q quit",
    )
    .style(Style::default().fg(Color::Gray))
    .alignment(Alignment::Center)
    .block(Block::default().borders(Borders::ALL));
    f.render_widget(help, chunks[3]);

    if let Some((prompt, input)) = &panel.prompt {
        draw_prompt(f, prompt, input);
    }
    if let Some(text) = &view.alert {
        draw_alert(f, text);
    }
}

fn draw_connection(f: &mut Frame, view: &View, area: Rect) {
    let style = match view.affordance {
        Affordance::Idle => Style::default().fg(Color::White),
        Affordance::Scanning | Affordance::Connecting => Style::default().fg(Color::Yellow),
        Affordance::Connected(_) => Style::default()
            .fg(Color::Green)
            .add_modifier(Modifier::BOLD),
    };
    let button = if view.affordance.enabled() {
        format!("[c] {}", view.affordance.label())
    } else {
        view.affordance.label()
    };

    let mut lines = vec![Line::from(Span::styled(button, style))];
    if view.cable_busy {
        lines.push(Line::from(Span::styled(
            "USB: busy",
            Style::default().fg(Color::Yellow),
        )));
    }

    let widget = Paragraph::new(lines)
        .wrap(Wrap { trim: true })
        .block(Block::default().title("Link").borders(Borders::ALL));
    f.render_widget(widget, area);
}

fn dpad_button(view: &View, direction: Direction, glyph: &'static str) -> Span<'static> {
    if view.active.contains(&direction) {
        Span::styled(
            glyph,
            Style::default()
                .fg(Color::Black)
                .bg(Color::Green)
                .add_modifier(Modifier::BOLD),
        )
    } else {
        Span::raw(glyph)
    }
}

fn draw_dpad(f: &mut Frame, view: &View, area: Rect) {
    let lines = vec![
        Line::from(dpad_button(view, Direction::Forward, "[ ▲ ]")),
        Line::from(vec![
            dpad_button(view, Direction::Left, "[ ◀ ]"),
            Span::raw("     "),
            dpad_button(view, Direction::Right, "[ ▶ ]"),
        ]),
        Line::from(dpad_button(view, Direction::Backward, "[ ▼ ]")),
    ];
    let widget = Paragraph::new(lines)
        .alignment(Alignment::Center)
        .block(Block::default().title("Drive").borders(Borders::ALL));
    f.render_widget(widget, area);
}

fn draw_speed(f: &mut Frame, view: &View, area: Rect) {
    let gauge = Gauge::default()
        .block(Block::default().title("Speed").borders(Borders::ALL))
        .gauge_style(Style::default().fg(Color::Cyan))
        .ratio(view.speed_ratio.clamp(0.0, 1.0))
        .label(format!("Speed: {}", view.speed));
    f.render_widget(gauge, area);
}

fn draw_log(f: &mut Frame, view: &View, area: Rect) {
    let visible = area.height.saturating_sub(2) as usize;
    let skip = view.lines.len().saturating_sub(visible);
    let items: Vec<ListItem> = view
        .lines
        .iter()
        .skip(skip)
        .map(|l| ListItem::new(l.as_str()))
        .collect();
    let list = List::new(items).block(Block::default().title("Log").borders(Borders::ALL));
    f.render_widget(list, area);
}

fn draw_prompt(f: &mut Frame, prompt: &Prompt, input: &str) {
    let area = centered(f.area(), 60, 5);
    let widget = Paragraph::new(vec![
        Line::from(format!("> {input}_")),
        Line::from(Span::styled(
            "Enter to confirm, Esc to cancel",
            Style::default().fg(Color::Gray),
        )),
    ])
    .block(
        Block::default()
            .title(prompt.title())
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::Cyan)),
    );
    f.render_widget(Clear, area);
    f.render_widget(widget, area);
}

fn draw_alert(f: &mut Frame, text: &str) {
    let mut lines: Vec<Line> = text.lines().map(|l| Line::from(l.to_string())).collect();
    lines.push(Line::from(""));
    lines.push(Line::from(Span::styled(
        "Press Enter to dismiss",
        Style::default().fg(Color::Gray),
    )));

    let height = (lines.len() as u16).saturating_add(2);
    let area = centered(f.area(), 60, height);
    let widget = Paragraph::new(lines)
        .wrap(Wrap { trim: false })
        .alignment(Alignment::Center)
        .block(
            Block::default()
                .title("Alert")
                .borders(Borders::ALL)
                .border_style(Style::default().fg(Color::Red)),
        );
    f.render_widget(Clear, area);
    f.render_widget(widget, area);
}

/// Rect of `width` percent and `height` rows centered in `area`.
fn centered(area: Rect, width: u16, height: u16) -> Rect {
    let w = (u32::from(area.width) * u32::from(width.min(100)) / 100) as u16;
    let h = height.min(area.height);
    Rect {
        x: area.x + (area.width - w) / 2,
        y: area.y + (area.height - h) / 2,
        width: w,
        height: h,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::Console;
    use crate::mock::{wait_until, MockCable, MockLoader, MockWireless};
    use crate::settings::Settings;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    fn app(wireless: &Arc<MockWireless>, cable: &Arc<MockCable>, stop_on_release: bool) -> App {
        let mut settings = Settings::default();
        settings.ble.scan_seconds = 1;
        settings.controls.send_stop_on_release = stop_on_release;
        App::new(
            &settings,
            Console::new(),
            wireless.clone(),
            cable.clone(),
            Arc::new(MockLoader::new()),
        )
        .unwrap()
    }

    fn panel(releases: bool) -> Panel {
        Panel {
            prompt: None,
            releases,
            quit: false,
        }
    }

    fn key(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    async fn type_text(app: &mut App, panel: &mut Panel, text: &str) {
        for c in text.chars() {
            handle_key(app, panel, key(KeyCode::Char(c))).await;
        }
    }

    fn has_line(console: &Console, text: &str) -> bool {
        console.lines().iter().any(|l| l.ends_with(text))
    }

    #[tokio::test]
    async fn test_auto_repeat_without_releases_sends_once() {
        let wireless = MockWireless::new("SuperBot");
        let cable = Arc::new(MockCable::new());
        let mut app = app(&wireless, &cable, true);
        let mut panel = panel(false);
        app.connect_clicked().await.unwrap();

        for _ in 0..3 {
            handle_key(&mut app, &mut panel, key(KeyCode::Up)).await;
        }
        assert_eq!(wireless.channel.writes(), vec!["F"]);
        assert!(app.dispatcher.is_active(Direction::Forward));

        // A different arrow still replaces the held one
        handle_key(&mut app, &mut panel, key(KeyCode::Left)).await;
        assert_eq!(wireless.channel.writes(), vec!["F", "S", "L"]);
        assert!(!app.dispatcher.is_active(Direction::Forward));
        assert!(app.dispatcher.is_active(Direction::Left));
    }

    #[tokio::test]
    async fn test_key_releases_drive_press_and_release() {
        let wireless = MockWireless::new("SuperBot");
        let cable = Arc::new(MockCable::new());
        let mut app = app(&wireless, &cable, true);
        let mut panel = panel(true);
        app.connect_clicked().await.unwrap();

        handle_key(&mut app, &mut panel, key(KeyCode::Right)).await;
        let repeat = KeyEvent::new_with_kind(KeyCode::Right, KeyModifiers::NONE, KeyEventKind::Repeat);
        handle_key(&mut app, &mut panel, repeat).await;
        let release =
            KeyEvent::new_with_kind(KeyCode::Right, KeyModifiers::NONE, KeyEventKind::Release);
        handle_key(&mut app, &mut panel, release).await;

        assert_eq!(wireless.channel.writes(), vec!["R", "S"]);
        assert!(!app.dispatcher.is_active(Direction::Right));
    }

    #[tokio::test]
    async fn test_alert_swallows_gestures_until_dismissed() {
        let wireless = MockWireless::new("SuperBot");
        let cable = Arc::new(MockCable::new());
        let mut app = app(&wireless, &cable, false);
        let mut panel = panel(false);
        app.connect_clicked().await.unwrap();
        app.console.alert("Robot renamed");

        handle_key(&mut app, &mut panel, key(KeyCode::Up)).await;
        handle_key(&mut app, &mut panel, key(KeyCode::Char('n'))).await;
        handle_key(&mut app, &mut panel, key(KeyCode::Char('q'))).await;
        assert!(wireless.channel.writes().is_empty());
        assert!(panel.prompt.is_none());
        assert!(!panel.quit);

        handle_key(&mut app, &mut panel, key(KeyCode::Enter)).await;
        assert!(app.console.pending_alert().is_none());

        handle_key(&mut app, &mut panel, key(KeyCode::Up)).await;
        assert_eq!(wireless.channel.writes(), vec!["F"]);
    }

    #[tokio::test]
    async fn test_rename_prompt_reaches_cable() {
        let wireless = MockWireless::new("SuperBot");
        let cable = Arc::new(MockCable::new());
        let mut app = app(&wireless, &cable, false);
        let mut panel = panel(false);

        handle_key(&mut app, &mut panel, key(KeyCode::Char('n'))).await;
        assert_eq!(panel.prompt, Some((Prompt::Rename, String::new())));

        // Typed letters go to the prompt, not to the panel shortcuts
        type_text(&mut app, &mut panel, "Roverq").await;
        handle_key(&mut app, &mut panel, key(KeyCode::Backspace)).await;
        assert!(!panel.quit);
        handle_key(&mut app, &mut panel, key(KeyCode::Enter)).await;
        assert!(panel.prompt.is_none());

        let cable_ref = cable.as_ref();
        wait_until(|| async move { !cable_ref.written().is_empty() }).await;
        assert_eq!(cable.written(), vec![b"NAME:Rover\n".to_vec()]);
    }

    #[tokio::test]
    async fn test_empty_flash_prompt_asks_for_image() {
        let wireless = MockWireless::new("SuperBot");
        let cable = Arc::new(MockCable::new());
        let mut app = app(&wireless, &cable, false);
        let mut panel = panel(false);

        handle_key(&mut app, &mut panel, key(KeyCode::Char('f'))).await;
        assert_eq!(panel.prompt, Some((Prompt::Flash, String::new())));
        type_text(&mut app, &mut panel, "  ").await;
        handle_key(&mut app, &mut panel, key(KeyCode::Enter)).await;

        let console = &app.console;
        wait_until(|| async move { has_line(console, "Please select a .bin file first.") }).await;
        assert_eq!(cable.requests.load(Ordering::SeqCst), 0);
        assert_eq!(app.firmware, None);
    }

    #[tokio::test]
    async fn test_prompt_escape_and_quit_keys() {
        let wireless = MockWireless::new("SuperBot");
        let cable = Arc::new(MockCable::new());
        let mut app = app(&wireless, &cable, false);
        let mut panel = panel(false);

        handle_key(&mut app, &mut panel, key(KeyCode::Char('n'))).await;
        handle_key(&mut app, &mut panel, key(KeyCode::Esc)).await;
        assert!(panel.prompt.is_none());
        assert!(!panel.quit);
        assert!(cable.written().is_empty());

        handle_key(&mut app, &mut panel, key(KeyCode::Char('n'))).await;
        let ctrl_c = KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL);
        handle_key(&mut app, &mut panel, ctrl_c).await;
        assert!(panel.quit);
    }

    #[tokio::test]
    async fn test_quit_then_shutdown_drops_link() {
        let wireless = MockWireless::new("SuperBot");
        let cable = Arc::new(MockCable::new());
        let mut app = app(&wireless, &cable, false);
        let mut panel = panel(false);
        app.connect_clicked().await.unwrap();

        handle_key(&mut app, &mut panel, key(KeyCode::Char('q'))).await;
        assert!(panel.quit);
        app.shutdown().await;
        assert!(wireless.channel.closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_arrow_keys_map_to_dpad() {
        assert_eq!(direction_for(KeyCode::Up), Some(Direction::Forward));
        assert_eq!(direction_for(KeyCode::Down), Some(Direction::Backward));
        assert_eq!(direction_for(KeyCode::Left), Some(Direction::Left));
        assert_eq!(direction_for(KeyCode::Right), Some(Direction::Right));
        assert_eq!(direction_for(KeyCode::Char('w')), None);
    }

    #[test]
    fn test_centered_stays_inside() {
        let outer = Rect::new(0, 0, 80, 24);
        let inner = centered(outer, 60, 5);
        assert_eq!(inner.width, 48);
        assert_eq!(inner.height, 5);
        assert_eq!(inner.x, 16);
        assert_eq!(inner.y, 9);

        let tiny = centered(Rect::new(0, 0, 10, 3), 60, 8);
        assert_eq!(tiny.height, 3);
        assert_eq!(tiny.y, 0);
    }
}
