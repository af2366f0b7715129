use genex::agent::{ExplorationAgent, Goal};
use genex::environment::{Environment, EnvironmentGenerator};
use genex::mapping::{MappingTask, SurfaceClass};
use genex::{GenexError, Settings};
use ndarray::Array3;

fn settings() -> Settings {
    let mut settings = Settings::default();
    settings.generator.panorama_height = 48;
    settings.model_paths.depth_estimator = None;
    settings.agent.sensor_range = 2.0;
    settings.agent.max_steps = 80;
    settings
}

fn environment(settings: &Settings) -> Environment {
    let img = Array3::from_shape_fn((60, 80, 3), |(y, x, c)| ((x * 3 + y * 2 + c * 40) % 200 + 20) as u8);
    EnvironmentGenerator::new(settings).generate_environment(img.view()).unwrap()
}

/// Reachable walkable cell centre roughly `distance` metres from the spawn
fn goal_near(env: &Environment, distance: f32) -> [f32; 3] {
    let nav = &env.navigation_map;
    let spawn = nav.frame.cell_center(nav.spawn);
    let reachable = nav.reachable_from(nav.spawn);
    let best = (0..nav.frame.len())
        .filter(|&i| reachable[i])
        .map(|i| nav.frame.cell_center(nav.frame.cell_at(i)))
        .min_by(|a, b| {
            let da = ((a[0] - spawn[0]).hypot(a[1] - spawn[1]) - distance).abs();
            let db = ((b[0] - spawn[0]).hypot(b[1] - spawn[1]) - distance).abs();
            da.total_cmp(&db)
        })
        .unwrap();
    [best[0], 0.0, best[1]]
}

#[test]
fn exploration_covers_more_over_time() {
    let settings = settings();
    let env = environment(&settings);
    let trajectory = ExplorationAgent::new(&settings).explore(&env, None).unwrap();

    assert!(trajectory.len() > 1);
    let first = trajectory.first().unwrap().observations.coverage;
    let last = trajectory.last().unwrap().observations.coverage;
    assert!(last > first);
    assert!(last <= 1.0);
    for s in &trajectory {
        assert_eq!(s.observations.ranges.len(), settings.agent.rays);
        assert_eq!(s.imagined_states.len(), settings.agent.headings);
        assert!(s.observations.ranges.iter().all(|r| *r <= settings.agent.sensor_range + 1e-4));
    }
}

#[test]
fn goal_run_ends_at_the_goal() {
    let settings = settings();
    let env = environment(&settings);
    let target = goal_near(&env, 1.5);
    let goal = Goal { position: target, tolerance: Some(0.4) };

    let trajectory = ExplorationAgent::new(&settings).explore(&env, Some(&goal)).unwrap();
    let end = trajectory.last().unwrap().position;
    let miss = (end[0] - target[0]).hypot(end[2] - target[2]);
    assert!(miss <= 0.4 + 1e-4, "ended {miss} m from the goal");
}

#[test]
fn goal_run_ignores_coverage_target() {
    let mut settings = settings();
    settings.agent.coverage_target = 0.0;
    let env = environment(&settings);
    let target = goal_near(&env, 1.5);
    let goal = Goal { position: target, tolerance: Some(0.4) };

    let trajectory = ExplorationAgent::new(&settings).explore(&env, Some(&goal)).unwrap();
    assert!(trajectory.len() > 1);
    let end = trajectory.last().unwrap().position;
    assert!((end[0] - target[0]).hypot(end[2] - target[2]) <= 0.4 + 1e-4);
}

#[test]
fn trajectory_json_round_trips() {
    let settings = settings();
    let env = environment(&settings);
    let trajectory = ExplorationAgent::new(&settings).explore(&env, None).unwrap();

    let json = serde_json::to_string(&trajectory).unwrap();
    let back: Vec<genex::ExplorationState> = serde_json::from_str(&json).unwrap();
    assert_eq!(back, trajectory);
}

#[test]
fn map_from_exploration() {
    let settings = settings();
    let env = environment(&settings);
    let trajectory = ExplorationAgent::new(&settings).explore(&env, None).unwrap();
    let task = MappingTask::new(&settings);
    let map = task.create_map(&env, &trajectory).unwrap();

    assert!(!map.point_cloud.is_empty());
    assert!(map.meshes.iter().any(|m| m.label == SurfaceClass::Floor));
    assert!(map.annotations.iter().all(|a| a.point_count > 0 && a.area > 0.0));

    let path = map.navigation_paths.iter().find(|p| p.target == "trajectory").unwrap();
    assert!(path.waypoints.len() >= 1);
    let start = trajectory.first().unwrap().position;
    let first = path.waypoints[0];
    assert!((first[0] - start[0]).hypot(first[2] - start[2]) <= settings.generator.cell_size);

    assert!(matches!(task.create_map(&env, &[]), Err(GenexError::EmptyExploration)));
}
