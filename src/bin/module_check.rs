use std::path::PathBuf;
use std::process;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use kestrel_script::logging::init_logging;
use kestrel_script::{
    Event, EventOutcome, EventType, GameModule, GameModuleLoader, Handle, ScriptExecutor, ScriptingConfig,
};

#[derive(Parser)]
#[command(version, about = "Load game modules and report their script listeners", long_about = None)]
struct Cli {
    /// Scripting config file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Extra directory to scan for module descriptions
    #[arg(short, long = "root")]
    roots: Vec<PathBuf>,

    /// Event to fire after loading: a well-known event name or any generic event type
    #[arg(short, long)]
    fire: Option<String>,

    /// Keep running and apply hot reloads
    #[arg(short, long)]
    watch: bool,

    /// Modules to load. Every scanned module when empty
    modules: Vec<String>,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("module_check error: {err:?}");
        process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => ScriptingConfig::load(path)?,
        None => ScriptingConfig::default(),
    };
    config.script_roots.extend(cli.roots.iter().cloned());
    config.hot_reload = cli.watch;
    init_logging(&config.log_filter)?;

    let executor = ScriptExecutor::from_config(&config).context("create script executor")?;
    let mut loader = GameModuleLoader::new(executor.clone(), &config);
    let found = loader.init().context("scan for game modules")?;
    println!("Found {found} game module(s)");

    let names: Vec<String> = if cli.modules.is_empty() {
        loader.known_modules().into_iter().map(|(name, _)| name).collect()
    } else {
        cli.modules.clone()
    };

    let mut loaded = Vec::new();
    let mut failures = 0;
    for name in &names {
        match loader.load(name, "module_check") {
            Ok(module) => {
                report_module(&module);
                loaded.push(module);
            }
            Err(err) => {
                failures += 1;
                println!("FAIL {name}: {err}");
            }
        }
    }

    if let Some(event_name) = &cli.fire {
        let event = match EventType::from_name(event_name) {
            Some(event_type) => Event::new(event_type),
            None => Event::generic(event_name.as_str()),
        };
        for module in &loaded {
            match module.fire_event(&event) {
                Ok(EventOutcome::Handled) => println!("{} handled {event}", module.name()),
                Ok(_) => println!("{} ignored {event}", module.name()),
                Err(err) => {
                    failures += 1;
                    println!("{} failed {event}: {err}", module.name());
                }
            }
        }
    }

    if cli.watch {
        let interval = config.watch_poll_interval();
        println!("Watching for changes (Ctrl+C to stop)");
        loop {
            let reloaded = executor.poll_file_changes();
            if reloaded > 0 {
                println!("Reloaded {reloaded} module(s)");
            }
            thread::sleep(interval.max(Duration::from_millis(50)));
        }
    }

    let stats = executor.stats();
    println!(
        "Loaded {} of {} module(s), {} build(s), {} invocation(s)",
        loaded.len(),
        names.len(),
        stats.builds,
        stats.invocations
    );
    if failures > 0 {
        process::exit(2);
    }
    Ok(())
}

fn report_module(module: &Handle<GameModule>) {
    println!("OK {module}");
    if !module.imports().is_empty() {
        println!("  imports: {}", module.imports().join(", "));
    }
    let Some(script) = module.script() else {
        return;
    };
    for listener in script.listeners() {
        match &listener.generic_type {
            Some(event_type) => println!("  {} -> {}({event_type})", listener.function.name(), listener.kind),
            None => println!("  {} -> {}", listener.function.name(), listener.kind),
        }
    }
}
