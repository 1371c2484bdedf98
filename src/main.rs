use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use crossterm::{
    event::{DisableMouseCapture, EnableMouseCapture},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{backend::CrosstermBackend, Terminal};
use tracing::{error, info};

use rota_core::clock::SystemClock;
use rota_core::engine::Engine;
use rota_core::evidence::FileEvidenceSink;
use rota_core::logger;
use rota_core::platform::{create_platform, Collaborators};
use rota_core::scheduler::TriggerOutcome;
use rota_core::settings::Settings;
use rota_core::state::{CycleStore, StopSignal};

#[derive(Parser)]
#[command(name = "rota", version, about = "Unattended account rotation over a desktop client")]
struct Args {
    /// Directory that relative paths in the config resolve against.
    #[arg(long, default_value = ".")]
    base_dir: PathBuf,
    /// Settings file (default: <base-dir>/config.json).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Show the live monitor while the command runs.
    #[arg(long)]
    tui: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Run one cycle over the account pool.
    Once,
    /// Fire cycles on the configured schedule.
    Schedule,
    /// Ask a running cycle to halt at the next account boundary.
    Stop,
    /// Remove the stop flag.
    Resume,
    /// Print the persisted cycle state.
    Status,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = args.config.clone().unwrap_or_else(|| args.base_dir.join("config.json"));
    let settings = Settings::load(&config).with_context(|| format!("loading settings from {}", config.display()))?;
    let paths = settings.paths.resolve(&args.base_dir);

    // Flag and status commands must not touch the log of a running worker.
    match args.command {
        Command::Stop => {
            StopSignal::new(&paths.stop_flag).request().context("raising stop flag")?;
            println!("stop requested: {}", paths.stop_flag.display());
            return Ok(());
        }
        Command::Resume => {
            StopSignal::new(&paths.stop_flag).clear().context("clearing stop flag")?;
            println!("stop flag cleared");
            return Ok(());
        }
        Command::Status => {
            print_status(&CycleStore::new(&paths.state), &StopSignal::new(&paths.stop_flag));
            return Ok(());
        }
        Command::Once | Command::Schedule => {}
    }

    logger::init(&paths.logs)?;
    let collab = Collaborators::from_stub(
        create_platform(),
        Arc::new(FileEvidenceSink::new(&paths.evidence)),
        Arc::new(SystemClock::new()),
    );
    let engine = Arc::new(Engine::new(settings, &args.base_dir, collab).context("starting engine")?);
    info!(command = args.command_name(), base_dir = %args.base_dir.display(), "rota started");

    let shutdown = Arc::new(AtomicBool::new(false));
    if !args.tui {
        println!("{}", work(&engine, args.command, &shutdown)?);
        return Ok(());
    }

    let (log_tx, log_rx) = mpsc::channel::<String>();
    logger::set_tui_sender(log_tx);

    let done = Arc::new(AtomicBool::new(false));
    let worker = {
        let (engine, shutdown, done) = (engine.clone(), shutdown.clone(), done.clone());
        let command = args.command;
        thread::spawn(move || {
            let result = work(&engine, command, &shutdown);
            match &result {
                Ok(report) => info!("{}", report),
                Err(e) => error!(error = %e, "worker stopped"),
            }
            done.store(true, Ordering::SeqCst);
            result
        })
    };

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout))?;

    let mut app = rota_tui::App::new(engine.monitor(), engine.stop_signal(), done.clone(), log_rx);
    let ui_result = rota_tui::event::run(&mut terminal, &mut app);

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen, DisableMouseCapture)?;
    terminal.show_cursor()?;

    shutdown.store(true, Ordering::SeqCst);
    if !done.load(Ordering::SeqCst) {
        println!("waiting for the current account to finish...");
    }
    let report = worker.join().map_err(|_| anyhow::anyhow!("worker thread panicked"))??;
    ui_result?;
    println!("{}", report);
    Ok(())
}

impl Args {
    fn command_name(&self) -> &'static str {
        match self.command {
            Command::Once => "once",
            Command::Schedule => "schedule",
            Command::Stop => "stop",
            Command::Resume => "resume",
            Command::Status => "status",
        }
    }
}

/// Run the command to completion and describe how it ended.
fn work(engine: &Engine, command: Command, shutdown: &AtomicBool) -> Result<String> {
    if command == Command::Schedule {
        engine.run_schedule(shutdown).context("running schedule")?;
        return Ok("scheduler stopped".into());
    }
    match engine.run_cycle() {
        TriggerOutcome::Ran(s) => Ok(format!(
            "cycle {} {:?}: {} ok, {} failed, next index {}",
            s.cycle_id, s.status, s.succeeded, s.failed, s.next_index
        )),
        TriggerOutcome::StopRequested => Ok("stop flag is set, nothing run (use `rota resume`)".into()),
        TriggerOutcome::Busy => bail!("another cycle holds the execution lock"),
        TriggerOutcome::Failed(reason) => bail!("cycle failed: {}", reason),
    }
}

fn print_status(store: &CycleStore, stop: &StopSignal) {
    match store.load() {
        Some(st) => {
            println!("cycle       {}", st.cycle_id);
            println!("status      {:?}", st.status);
            println!("next index  {} of {}", st.next_index, st.total);
            println!("updated     {}", st.last_updated.format("%Y-%m-%d %H:%M:%S"));
        }
        None => println!("no cycle recorded at {}", store.path().display()),
    }
    if stop.is_set() {
        println!("stop flag   set");
    }
}
