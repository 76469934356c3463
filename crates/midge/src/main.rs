//! Midge - simulated-flight runner for the multirotor state estimator

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use midge_core::EkfConfig;
use midge_sim::{generate_timeline, run_estimator, ScenarioConfig};

#[derive(Parser, Debug)]
#[command(name = "midge")]
#[command(about = "Run a simulated flight through the attitude/altitude estimator")]
#[command(version)]
struct Args {
    /// Output directory
    #[arg(short, long, default_value = "output")]
    output_dir: PathBuf,

    // ── Flight profile ────────────────────────────────────────
    #[arg(long, default_value_t = 5.0)]
    duration: f64,

    #[arg(long, default_value_t = 1.0)]
    climb_altitude: f64,

    // ── Sensor options ────────────────────────────────────────
    #[arg(long, default_value_t = 1000)]
    imu_rate: u32,

    #[arg(long, default_value_t = 100)]
    flow_rate: u32,

    #[arg(long, default_value_t = 40)]
    range_rate: u32,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    #[arg(long, default_value_t = 1.0)]
    noise_scale: f64,

    #[arg(long, default_value_t = 0.1)]
    gyro_noise_std: f64,

    #[arg(long, default_value_t = 0.002)]
    accel_noise_std: f64,

    #[arg(long, default_value_t = 0.5)]
    flow_noise_std: f64,

    #[arg(long, default_value_t = 5.0)]
    range_noise_std: f64,

    // ── Filter options ────────────────────────────────────────
    #[arg(long, default_value_t = 10)]
    prediction_interval_ms: u32,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    println!("Midge estimator replay");
    println!("======================\n");

    let scenario = ScenarioConfig {
        duration_s: args.duration,
        climb_altitude_m: args.climb_altitude,
        imu_rate_hz: args.imu_rate,
        flow_rate_hz: args.flow_rate,
        range_rate_hz: args.range_rate,
        noise_scale: args.noise_scale,
        gyro_noise_std: args.gyro_noise_std,
        accel_noise_std: args.accel_noise_std,
        flow_noise_std: args.flow_noise_std,
        range_noise_std: args.range_noise_std,
        seed: args.seed,
    };

    let config = EkfConfig {
        prediction_interval_ms: args.prediction_interval_ms,
        ..Default::default()
    };

    println!("Generating sensor streams...");
    let timeline = generate_timeline(&scenario);

    println!("Running estimator...");
    let trace = run_estimator(&timeline, config);
    tracing::info!("replay complete: {} trace rows", trace.time_s.len());

    let final_state = trace
        .estimate
        .last()
        .context("empty trace; duration too short")?;
    let rmse = trace.altitude_rmse();

    println!("\nRun Stats:");
    println!("  Samples:     {}", timeline.events.len());
    println!("  Trace rows:  {}", trace.time_s.len());
    println!("  Final z:     {:.3} m", final_state.z);
    println!("  Final dz:    {:.3} m/s", final_state.dz);
    println!("  Alt RMSE:    {:.4} m", rmse);
    println!("-----------------------------");

    write_output(&args, &trace, rmse)?;

    Ok(())
}

fn write_output(args: &Args, trace: &midge_sim::EstimateTrace, rmse: f64) -> Result<()> {
    std::fs::create_dir_all(&args.output_dir)?;

    let csv_path = args.output_dir.join("estimate.csv");
    let mut wtr = csv::Writer::from_path(&csv_path)
        .with_context(|| format!("creating {:?}", csv_path))?;

    wtr.write_record([
        "time",
        "est_z",
        "est_dz",
        "est_phi",
        "est_theta",
        "est_psi",
        "true_z",
        "true_dz",
    ])?;

    for i in 0..trace.time_s.len() {
        let est = &trace.estimate[i];
        wtr.write_record(&[
            format!("{:.3}", trace.time_s[i]),
            format!("{:.4}", est.z),
            format!("{:.4}", est.dz),
            format!("{:.4}", est.phi),
            format!("{:.4}", est.theta),
            format!("{:.4}", est.psi),
            format!("{:.4}", trace.truth_z[i]),
            format!("{:.4}", trace.truth_dz[i]),
        ])?;
    }
    wtr.flush()?;
    println!("Trace written to {:?}", csv_path);

    let summary = serde_json::json!({
        "duration_s": args.duration,
        "climb_altitude_m": args.climb_altitude,
        "seed": args.seed,
        "noise_scale": args.noise_scale,
        "altitude_rmse_m": rmse,
        "final": {
            "z": trace.estimate.last().map(|s| s.z),
            "dz": trace.estimate.last().map(|s| s.dz),
            "psi": trace.estimate.last().map(|s| s.psi),
        },
    });
    let summary_path = args.output_dir.join("summary.json");
    std::fs::write(&summary_path, serde_json::to_string_pretty(&summary)?)?;
    println!("Summary written to {:?}", summary_path);

    Ok(())
}
