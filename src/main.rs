//! CFG-Neuralese CLI - Run an offline grammar search from JSON configuration.

use std::fs;
use std::path::PathBuf;

use cfg_neuralese::{
    agents::{OfflineHarness, OfflineProposer},
    grammar::BASE_GRAMMAR,
    schema::{SearchConfig, SearchPhase},
    search::SearchController,
};

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        eprintln!("Usage: {} <config.json> [rounds.jsonl]", args[0]);
        eprintln!();
        eprintln!("Search for a compressed message grammar using the offline agents.");
        eprintln!();
        eprintln!("Arguments:");
        eprintln!("  config.json   Path to search configuration file");
        eprintln!("  rounds.jsonl  Optional round log output path");
        eprintln!();
        eprintln!("Example configuration is generated with --example flag.");
        std::process::exit(1);
    }

    if args[1] == "--example" {
        print_example_config();
        return;
    }

    let config_path = PathBuf::from(&args[1]);
    let log_path = args.get(2).map(PathBuf::from);

    // Load configuration
    let config_str = fs::read_to_string(&config_path).unwrap_or_else(|e| {
        eprintln!("Error reading config file: {}", e);
        std::process::exit(1);
    });

    let config: SearchConfig = serde_json::from_str(&config_str).unwrap_or_else(|e| {
        eprintln!("Error parsing config: {}", e);
        std::process::exit(1);
    });

    let seed = config.random_seed.unwrap_or_else(rand::random);
    let proposer = OfflineProposer::new();
    let harness = OfflineHarness::new(seed);

    println!("CFG-Neuralese Grammar Search");
    println!("============================");
    println!(
        "Population: {} survivors x {} proposals",
        config.population.survivors, config.population.proposals_per_parent
    );
    println!("Generations: {}", config.population.max_generations);
    println!("Batch size: {}", config.evaluation.batch_size);
    println!("Seed: {}", seed);
    println!();
    println!("Base grammar:");
    print!("{}", BASE_GRAMMAR);
    println!();

    let mut controller = SearchController::new(config, proposer, harness).unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    });

    if let Some(path) = log_path {
        controller = controller.with_round_log(&path).unwrap_or_else(|e| {
            eprintln!("Error opening round log: {}", e);
            std::process::exit(1);
        });
    }

    println!("Running search...");
    let result = controller
        .run_with_callback(|progress| {
            if progress.phase == SearchPhase::Terminated {
                return;
            }
            println!(
                "  Generation {}/{}: best={:.3}, {:.1} chars/msg, stagnation={}",
                progress.generation,
                progress.total_generations,
                progress.best_score,
                progress.best_avg_msg_chars,
                progress.stagnation
            );
        })
        .unwrap_or_else(|e| {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        });

    println!();
    println!("Stopped: {:?}", result.stats.stop_reason);
    println!(
        "Evaluated {} candidates over {} generations in {:.2}s",
        result.stats.candidates_evaluated, result.stats.generations, result.stats.elapsed_seconds
    );
    println!();
    println!("Best grammar (score {:.3}):", result.best.score);
    print!("{}", result.best.grammar);
    println!();
    println!(
        "  accuracy:       {:.3}",
        result.best.metrics.accuracy
    );
    println!(
        "  chars/msg:      {:.1}",
        result.best.metrics.avg_msg_chars
    );
    println!(
        "  collision rate: {:.3}",
        result.best.metrics.collision_rate
    );
    println!(
        "  productions:    {}",
        result.best.metrics.complexity.productions
    );
}

fn print_example_config() {
    let config = SearchConfig::default();

    println!("Example configuration (config.json):");
    println!("{}", serde_json::to_string_pretty(&config).unwrap());
    println!();
    println!("Base grammar:");
    print!("{}", BASE_GRAMMAR);
}
