// img2env - Offline pipeline: image to environment, optional exploration and map
//
// Usage: img2env <image> [--out DIR] [--explore] [--map] [--goal X,Z]
//
// Writes the environment to DIR/<id>; --explore adds trajectory.json and
// --map adds the semantic map under DIR/<id>/map.

use genex::agent::{ExplorationAgent, Goal};
use genex::config::Settings;
use genex::environment::EnvironmentGenerator;
use genex::mapping::MappingTask;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <image> [--out DIR] [--explore] [--map] [--goal X,Z]", args[0]);
        return ExitCode::FAILURE;
    }

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let image_path = &args[1];
    let settings = Settings::load()?;
    let mut out = settings.storage.environments_dir.clone();
    let mut explore = false;
    let mut map = false;
    let mut goal = None;

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            "--out" => { out = args.get(i + 1).map(PathBuf::from).unwrap_or(out); i += 2; }
            "--explore" => { explore = true; i += 1; }
            "--map" => { explore = true; map = true; i += 1; }
            "--goal" => { goal = args.get(i + 1).and_then(|s| parse_goal(s)); explore = true; i += 2; }
            _ => i += 1,
        }
    }

    println!("Processing {image_path}...");
    let bytes = std::fs::read(image_path)?;
    let generator = EnvironmentGenerator::new(&settings);
    let environment = generator.generate_from_bytes(&bytes)?;
    let dir = out.join(&environment.id);
    generator.save_environment(&environment, &dir)?;
    println!("  Environment {} -> {}", environment.id, dir.display());

    if !explore {
        return Ok(());
    }

    let mut agent = ExplorationAgent::new(&settings);
    let trajectory = agent.explore(&environment, goal.as_ref())?;
    std::fs::write(dir.join("trajectory.json"), serde_json::to_vec_pretty(&trajectory)?)?;
    let coverage = trajectory.last().map_or(0.0, |s| s.observations.coverage);
    println!("  Explored {} steps, coverage {:.0}%", trajectory.len(), coverage * 100.0);

    if map {
        let task = MappingTask::new(&settings);
        let semantic = task.create_map(&environment, &trajectory)?;
        task.save_map(&semantic, &dir.join("map"))?;
        println!(
            "  Map: {} points, {} meshes, {} paths",
            semantic.point_cloud.len(),
            semantic.meshes.len(),
            semantic.navigation_paths.len()
        );
    }

    println!("Done!");
    Ok(())
}

/// "x,z" on the floor plane
fn parse_goal(s: &str) -> Option<Goal> {
    let (x, z) = s.split_once(',')?;
    Some(Goal { position: [x.trim().parse().ok()?, 0.0, z.trim().parse().ok()?], tolerance: None })
}
