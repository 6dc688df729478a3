use anyhow::{Context, Result};
use clap::Parser;
use chrono::Utc;
use convert_core::{
    config::{config_path_or_default, ServiceConfig},
    snapshot::{load_snapshot, snapshot_path, JobSummary, Snapshot},
    JobState,
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    widgets::{Block, Borders, Gauge, Paragraph, Row, Table, TableState},
    Frame, Terminal,
};
use std::io::stdout;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use sysinfo::System;
use humansize::{format_size, BINARY};

const REFRESH_EVERY: Duration = Duration::from_secs(1);


struct App {
    snapshot: Option<Snapshot>,
    load_error: Option<String>,
    system: System,
    table_state: TableState,
    should_quit: bool,
    snapshot_file: PathBuf,
}

impl App {
    fn new(snapshot_file: PathBuf) -> Self {
        Self {
            snapshot: None,
            load_error: None,
            system: System::new(),
            table_state: TableState::default(),
            should_quit: false,
            snapshot_file,
        }
    }

    fn refresh(&mut self) {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();

        // Keep showing the last good snapshot if the daemon is mid-restart
        match load_snapshot(&self.snapshot_file) {
            Ok(mut snapshot) => {
                snapshot.jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                self.snapshot = Some(snapshot);
                self.load_error = None;
            }
            Err(e) => {
                self.load_error = Some(format!("{:#}", e));
            }
        }
    }

    fn jobs(&self) -> &[JobSummary] {
        self.snapshot.as_ref().map_or(&[][..], |s| s.jobs.as_slice())
    }

    fn count_by_state(&self, state: JobState) -> usize {
        self.jobs().iter().filter(|j| j.state == state).count()
    }
}

/// Conversion daemon dashboard
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Same default location as the daemon
    let config_path = config_path_or_default(args.config.as_deref());
    let cfg = ServiceConfig::load_config(config_path.as_deref())
        .context("Failed to load configuration")?;

    // Setup terminal
    crossterm::terminal::enable_raw_mode()?;
    let mut stdout = stdout();
    crossterm::execute!(stdout, crossterm::terminal::EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut app = App::new(snapshot_path(&cfg.storage.state_dir));
    app.refresh();
    let mut last_refresh = Instant::now();

    loop {
        if last_refresh.elapsed() >= REFRESH_EVERY {
            app.refresh();
            last_refresh = Instant::now();
        }

        terminal.draw(|f| ui(f, &mut app))?;

        if crossterm::event::poll(Duration::from_millis(100))? {
            if let crossterm::event::Event::Key(key) = crossterm::event::read()? {
                match key.code {
                    crossterm::event::KeyCode::Char('q') => app.should_quit = true,
                    crossterm::event::KeyCode::Char('r') => {
                        app.refresh();
                        last_refresh = Instant::now();
                    }
                    _ => {}
                }
            }
        }

        if app.should_quit {
            break;
        }
    }

    // Restore terminal
    crossterm::terminal::disable_raw_mode()?;
    crossterm::execute!(
        terminal.backend_mut(),
        crossterm::terminal::LeaveAlternateScreen
    )?;

    Ok(())
}

fn ui(f: &mut Frame, app: &mut App) {
    let size = f.size();

    if size.height < 10 || size.width < 80 {
        let error_msg = Paragraph::new("Terminal too small! Please resize to at least 80x10.")
            .block(Block::default().borders(Borders::ALL).title("Error"))
            .style(Style::default().fg(Color::Red));
        f.render_widget(error_msg, size);
        return;
    }

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // host gauges
            Constraint::Length(3), // service counters
            Constraint::Min(3),    // job table
            Constraint::Length(3), // status bar
        ])
        .split(size);

    render_host_bar(f, app, chunks[0]);
    render_service_bar(f, app, chunks[1]);
    render_job_table(f, app, chunks[2]);
    render_status_bar(f, app, chunks[3]);
}

fn clamp_percent(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 100.0)
    } else {
        0.0
    }
}

fn render_host_bar(f: &mut Frame, app: &App, area: Rect) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
        .split(area);

    let cpu_usage = clamp_percent(app.system.global_cpu_usage() as f64);
    let cpu_gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title("CPU"))
        .gauge_style(Style::default().fg(Color::Cyan))
        .percent(cpu_usage as u16)
        .label(format!("{:.1}%", cpu_usage));
    f.render_widget(cpu_gauge, chunks[0]);

    let total_memory = app.system.total_memory();
    let used_memory = app.system.used_memory();
    let memory_percent = if total_memory == 0 {
        0.0
    } else {
        clamp_percent(used_memory as f64 / total_memory as f64 * 100.0)
    };
    let memory_gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title("Memory"))
        .gauge_style(Style::default().fg(Color::Green))
        .percent(memory_percent as u16)
        .label(format!(
            "{} / {}",
            format_size(used_memory, BINARY),
            format_size(total_memory, BINARY)
        ));
    f.render_widget(memory_gauge, chunks[1]);
}

fn render_service_bar(f: &mut Frame, app: &App, area: Rect) {
    let text = match &app.snapshot {
        Some(snapshot) => {
            let stats = &snapshot.stats;
            format!(
                "Users: {} | Conversions: {} | Active jobs: {} | Premium: {}",
                stats.total_users, stats.total_conversions, stats.active_jobs, stats.premium_count
            )
        }
        None => "Waiting for the daemon's first snapshot...".to_string(),
    };
    let paragraph = Paragraph::new(text)
        .block(Block::default().borders(Borders::ALL).title("Service"));
    f.render_widget(paragraph, area);
}

fn state_label(state: JobState) -> &'static str {
    match state {
        JobState::Admitted => "QUEUE",
        JobState::Running => "RUN",
        JobState::Succeeded => "OK",
        JobState::Failed => "FAIL",
    }
}

fn format_age(seconds: i64) -> String {
    let seconds = seconds.max(0);
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m{:02}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h{:02}m", seconds / 3600, (seconds % 3600) / 60)
    }
}

fn render_job_table(f: &mut Frame, app: &mut App, area: Rect) {
    let header = Row::new(vec!["ST", "JOB", "OWNER", "TYPE", "SIZE", "AGE", "REASON"])
        .style(Style::default().add_modifier(Modifier::BOLD))
        .height(1);

    let max_rows = (area.height as usize).saturating_sub(3);
    let now = Utc::now();
    let jobs = app.jobs();

    let rows: Vec<Row> = if jobs.is_empty() {
        vec![Row::new(vec!["-", "No jobs", "-", "-", "-", "-", "-"]).height(1)]
    } else {
        jobs.iter()
            .take(max_rows)
            .map(|job| {
                Row::new(vec![
                    state_label(job.state).to_string(),
                    truncate_string(&job.id, 8),
                    truncate_string(&job.owner, 20),
                    job.mime_type.clone(),
                    format_size(job.size_bytes, BINARY),
                    format_age((now - job.created_at).num_seconds()),
                    truncate_string(job.failure.as_deref().unwrap_or("-"), 40),
                ])
                .height(1)
            })
            .collect()
    };

    let widths = [
        Constraint::Length(5),
        Constraint::Length(9),
        Constraint::Percentage(20),
        Constraint::Length(16),
        Constraint::Length(10),
        Constraint::Length(7),
        Constraint::Percentage(30),
    ];

    let title = format!("Jobs ({})", jobs.len());
    let table = Table::new(rows, widths)
        .header(header)
        .block(Block::default().borders(Borders::ALL).title(title))
        .column_spacing(1);

    f.render_stateful_widget(table, area, &mut app.table_state);
}

fn render_status_bar(f: &mut Frame, app: &App, area: Rect) {
    let generated = app
        .snapshot
        .as_ref()
        .map(|s| format_age((Utc::now() - s.generated_at).num_seconds()) + " ago")
        .unwrap_or_else(|| "never".to_string());

    let mut status_text = format!(
        "Queued: {} | Running: {} | Done: {} | Failed: {} | Snapshot: {} | q=quit r=refresh",
        app.count_by_state(JobState::Admitted),
        app.count_by_state(JobState::Running),
        app.count_by_state(JobState::Succeeded),
        app.count_by_state(JobState::Failed),
        generated,
    );
    let mut style = Style::default();
    if let Some(err) = &app.load_error {
        status_text = format!("{} | {}", truncate_string(err, 60), status_text);
        style = style.fg(Color::Yellow);
    }

    let paragraph = Paragraph::new(status_text)
        .block(Block::default().borders(Borders::ALL).title("Status"))
        .style(style)
        .wrap(ratatui::widgets::Wrap { trim: true });

    f.render_widget(paragraph, area);
}

/// Shorten to at most `max_len` characters, marking the cut with "..."
fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_format_age() {
        assert_eq!(format_age(-5), "0s");
        assert_eq!(format_age(59), "59s");
        assert_eq!(format_age(61), "1m01s");
        assert_eq!(format_age(7322), "2h02m");
    }

    #[test]
    fn test_clamp_percent() {
        assert_eq!(clamp_percent(f64::NAN), 0.0);
        assert_eq!(clamp_percent(150.0), 100.0);
        assert_eq!(clamp_percent(-1.0), 0.0);
    }

    #[test]
    fn test_truncate_keeps_short_strings() {
        assert_eq!(truncate_string("abc", 8), "abc");
        assert_eq!(truncate_string("0123456789", 8), "01234...");
    }

    proptest! {
        #[test]
        fn prop_truncate_respects_limit(s in "\\PC{0,64}", max_len in 3usize..40) {
            let out = truncate_string(&s, max_len);
            prop_assert!(out.chars().count() <= max_len);
            if s.chars().count() <= max_len {
                prop_assert_eq!(out, s);
            }
        }
    }
}
