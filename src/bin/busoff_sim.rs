/// Bus-Off Attack Simulator CLI
///
/// Runs one of the simulator's experiments with live colored output and a
/// summary report at the end.
use busoff_sim::{
    plain_arbitration, verify_log_file, ConsoleReporter, EventRecorder, EventSink, FanoutSink, RoundScheduler,
    Scenario, SimConfig, SimulationLog, SimulationReport,
};
use colored::*;
use std::path::PathBuf;
use std::process;
use std::str::FromStr;
use std::sync::Arc;

struct CliOptions {
    command: String,
    config: SimConfig,
    verbose: bool,
    json: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args: Vec<String> = std::env::args().collect();
    let options = parse_args(&args);

    print_banner(&options);

    let console: Arc<dyn EventSink> = Arc::new(ConsoleReporter::new(options.verbose));
    let recorder = Arc::new(EventRecorder::new());
    let mut fanout = FanoutSink::new().with(console).with(recorder.clone());

    let log = match &options.config.log_dir {
        Some(dir) => {
            let log = Arc::new(SimulationLog::create(&options.command, dir)?);
            println!("{} Event log: {}", "→".green(), log.path().display());
            fanout = fanout.with(log.clone());
            Some(log)
        }
        None => None,
    };
    let sink: Arc<dyn EventSink> = Arc::new(fanout);

    if options.command == "arbitration" {
        let run = plain_arbitration(&options.config, sink)?;
        println!();
        println!("{}", "Arbitration order:".bright_white().bold());
        for (slot, (sender, frame_id)) in run.delivery_order.iter().enumerate() {
            println!(
                "  {} {} {}",
                format!("#{}", slot + 1).cyan(),
                format!("0x{:03X}", frame_id).yellow(),
                sender
            );
        }
        println!();
        println!("Max concurrent deliveries: {}", run.bus.stats().max_concurrent_deliveries);
    } else {
        let scenario = match Scenario::from_str(&options.command) {
            Ok(scenario) => scenario,
            Err(e) => {
                eprintln!("{} {}", "✗".red(), e);
                print_usage();
                process::exit(1);
            }
        };

        let simulation = scenario.build(&options.config, sink)?;
        let (controller, _bus) = simulation.into_parts();

        println!(
            "{} Starting {} in {} ms, one round every {} ms",
            "→".green(),
            scenario.to_string().bright_red().bold(),
            options.config.start_delay_ms,
            options.config.round_interval_ms
        );
        println!();

        let handle = RoundScheduler::spawn(
            controller,
            options.config.start_delay(),
            options.config.round_interval(),
        );
        let controller = handle.join().await?;

        let report = SimulationReport::from_run(scenario.name(), &controller, &recorder)
            .with_fingerprint(options.config.fingerprint()?);
        if options.json {
            println!("{}", report.to_json()?);
        } else {
            println!("{}", report.generate_report());
        }
    }

    if let Some(log) = log {
        let result = verify_log_file(log.path())?;
        if result.verified {
            println!(
                "{} Event log verified ({} entries, hash chain intact)",
                "✓".green().bold(),
                result.total_entries
            );
        } else {
            println!("{} Event log verification failed:", "✗".red().bold());
            for issue in &result.issues {
                println!("  - {}", issue);
            }
        }
    }

    Ok(())
}

fn parse_args(args: &[String]) -> CliOptions {
    if args.len() < 2 || matches!(args[1].as_str(), "--help" | "-h") {
        print_usage();
        process::exit(if args.len() < 2 { 1 } else { 0 });
    }
    let command = args[1].to_lowercase();

    // --config is applied first so that other flags override the file
    let config_path = args
        .windows(2)
        .find(|pair| pair[0] == "--config" || pair[0] == "-c")
        .map(|pair| PathBuf::from(&pair[1]));
    let loaded = match config_path {
        Some(path) => SimConfig::from_json_file(&path),
        None => SimConfig::from_env(),
    };
    let mut config = loaded.unwrap_or_else(|e| fail(&e.to_string()));

    let mut verbose = false;
    let mut json = false;
    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            "--seed" | "-s" => {
                config.seed = Some(value(args, i, "--seed"));
                i += 2;
            }
            "--error-probability" | "-p" => {
                config.bit_error_probability = value(args, i, "--error-probability");
                i += 2;
            }
            "--max-rounds" | "-m" => {
                config.max_rounds = value(args, i, "--max-rounds");
                i += 2;
            }
            "--cooldown-rounds" => {
                config.cooldown_rounds = value(args, i, "--cooldown-rounds");
                i += 2;
            }
            "--interval-ms" | "-i" => {
                config.round_interval_ms = value(args, i, "--interval-ms");
                i += 2;
            }
            "--log-dir" | "-l" => {
                config.log_dir = Some(value(args, i, "--log-dir"));
                i += 2;
            }
            "--config" | "-c" => {
                i += 2;
            }
            "--preceding" => {
                config.preceding_frames = true;
                i += 1;
            }
            "--verbose" | "-v" => {
                verbose = true;
                i += 1;
            }
            "--json" => {
                json = true;
                i += 1;
            }
            other => fail(&format!("Unknown option: {}", other)),
        }
    }

    if let Err(e) = config.validate() {
        fail(&e.to_string());
    }

    CliOptions {
        command,
        config,
        verbose,
        json,
    }
}

fn value<T: FromStr>(args: &[String], i: usize, flag: &str) -> T {
    match args.get(i + 1) {
        Some(raw) => raw
            .parse()
            .unwrap_or_else(|_| fail(&format!("Invalid value for {}: {}", flag, raw))),
        None => fail(&format!("Missing value for {}", flag)),
    }
}

fn fail(message: &str) -> ! {
    eprintln!("{} {}", "✗".red(), message);
    process::exit(1);
}

fn print_banner(options: &CliOptions) {
    println!();
    println!("{}", "═══════════════════════════════════════".cyan().bold());
    println!("{}", "      CAN Bus-Off Attack Simulator     ".cyan().bold());
    println!("{}", "═══════════════════════════════════════".cyan().bold());
    println!();
    println!("  {} Experiment:        {}", "→".cyan(), options.command.bright_white());
    println!(
        "  {} Bit error rate:    {}",
        "→".cyan(),
        format!("{:.2}", options.config.bit_error_probability).bright_white()
    );
    println!(
        "  {} Seed:              {}",
        "→".cyan(),
        options
            .config
            .seed
            .map(|s| s.to_string())
            .unwrap_or_else(|| "random".to_string())
            .bright_white()
    );
    println!(
        "  {} Contested id:      {}",
        "→".cyan(),
        format!("0x{:03X}", options.config.contested_id).bright_white()
    );
    println!();
}

fn print_usage() {
    println!();
    println!("{}", "CAN Bus-Off Attack Simulator".bold());
    println!();
    println!("USAGE:");
    println!("    {} <EXPERIMENT> [OPTIONS]", "busoff_sim".green());
    println!();
    println!("EXPERIMENTS:");
    println!("    {:14} four ECUs contend, lowest identifier wins", "arbitration".yellow());
    for scenario in Scenario::ALL {
        println!("    {:14} {}", scenario.name().yellow(), scenario.description());
    }
    println!();
    println!("OPTIONS:");
    println!("    -s, --seed <N>                 Seed for the bit-error gates");
    println!("    -p, --error-probability <P>    Random bit-error probability (default 0.10)");
    println!("    -m, --max-rounds <N>           Give up after N attack rounds (default 1000)");
    println!("    -i, --interval-ms <MS>         Delay between rounds (default 500)");
    println!("        --cooldown-rounds <N>      Attacker pause after the victim resets (default 3)");
    println!("    -l, --log-dir <DIR>            Write a hash-chained JSONL event log");
    println!("    -c, --config <FILE>            Load settings from a JSON file");
    println!("        --preceding                Attacker sends preceding frames");
    println!("    -v, --verbose                  Print every frame and per-round counters");
    println!("        --json                     Print the final report as JSON");
    println!();
    println!("ENVIRONMENT:");
    println!("    BUSOFF_ERROR_PROBABILITY, BUSOFF_SEED, BUSOFF_MAX_ROUNDS,");
    println!("    BUSOFF_COOLDOWN_ROUNDS, BUSOFF_ROUND_INTERVAL_MS, BUSOFF_LOG_DIR");
    println!();
}
