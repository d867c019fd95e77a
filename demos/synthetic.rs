// SPDX-License-Identifier: MPL-2.0

//! Register a noisy and partially corrupted copy of a random point cloud
//! with each family of transformations.
//!
//! Run with `cargo run --example synthetic -- -vv` to see the iterations.

use cpd::{registration_cpd, Config, NonRigidOptions, Transformation};

use anyhow::Context;
use nalgebra::{DMatrix, DVector, Rotation3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::str::FromStr;

// Default values for some of the program arguments.
const DEFAULT_OUTLIER_WEIGHT: &str = "0.1";
const DEFAULT_MAX_ITERATIONS: &str = "100";
const DEFAULT_TOLERANCE: &str = "1e-6";
const DEFAULT_BETA: &str = "2.0";
const DEFAULT_LAMBDA: &str = "2.0";
const DEFAULT_POINTS: &str = "200";
const DEFAULT_OUTLIERS: &str = "10";
const DEFAULT_SEED: &str = "42";

const NOISE: f64 = 0.01;

/// Entry point of the program.
fn main() -> anyhow::Result<()> {
    let matches = cli().get_matches();
    // Set log verbosity.
    let verbosity = matches.occurrences_of("verbose");
    stderrlog::new()
        .quiet(false)
        .verbosity(verbosity as usize)
        .show_level(false)
        .color(stderrlog::ColorChoice::Never)
        .init()
        .context("Failed to initialize log verbosity")?;
    // Start program.
    run(get_args(&matches)?)
}

/// Command line interface of the program.
fn cli() -> clap::App<'static, 'static> {
    // CLI arguments related to the core parameters of the algorithm.
    let core_args = vec![
        clap::Arg::with_name("outlier-weight")
            .long("outlier-weight")
            .value_name("w")
            .default_value(DEFAULT_OUTLIER_WEIGHT)
            .help("Prior probability of a target point being an outlier, in [0, 1)"),
        clap::Arg::with_name("tolerance")
            .long("tolerance")
            .value_name("x")
            .default_value(DEFAULT_TOLERANCE)
            .help("Stop when the objective changes less than this between two iterations"),
        clap::Arg::with_name("max-iterations")
            .long("max-iterations")
            .value_name("N")
            .default_value(DEFAULT_MAX_ITERATIONS)
            .help("Maximum number of iterations"),
        clap::Arg::with_name("beta")
            .long("beta")
            .value_name("x")
            .default_value(DEFAULT_BETA)
            .help("Width of the smoothness kernel of non-rigid registration"),
        clap::Arg::with_name("lambda")
            .long("lambda")
            .value_name("x")
            .default_value(DEFAULT_LAMBDA)
            .help("Weight of the smoothness regularization of non-rigid registration"),
    ];
    // CLI arguments related to the synthetic data and the rest.
    let data_args = vec![
        clap::Arg::with_name("points")
            .long("points")
            .value_name("N")
            .default_value(DEFAULT_POINTS)
            .help("Number of source points"),
        clap::Arg::with_name("outliers")
            .long("outliers")
            .value_name("N")
            .default_value(DEFAULT_OUTLIERS)
            .help("Number of random outliers added to the target"),
        clap::Arg::with_name("seed")
            .long("seed")
            .value_name("N")
            .default_value(DEFAULT_SEED)
            .help("Seed of the random generator"),
        clap::Arg::with_name("verbose")
            .short("v")
            .multiple(true)
            .help("Multiple levels of verbosity (up to -vvvv)"),
    ];
    clap::App::new("synthetic")
        .version(std::env!("CARGO_PKG_VERSION"))
        .about("Coherent Point Drift registration of a synthetic point cloud")
        .args(&core_args)
        .args(&data_args)
}

#[derive(Debug)]
/// Type holding command line arguments.
struct Args {
    config: Config,
    options: NonRigidOptions,
    nb_points: usize,
    nb_outliers: usize,
    seed: u64,
}

/// Retrieve the program arguments from clap matches.
fn get_args(matches: &clap::ArgMatches) -> anyhow::Result<Args> {
    let config = Config {
        w: parse_arg(matches, "outlier-weight")?,
        max_iterations: parse_arg(matches, "max-iterations")?,
        tolerance: parse_arg(matches, "tolerance")?,
    };
    let options = NonRigidOptions {
        beta: parse_arg(matches, "beta")?,
        lambda: parse_arg(matches, "lambda")?,
    };
    Ok(Args {
        config,
        options,
        nb_points: parse_arg(matches, "points")?,
        nb_outliers: parse_arg(matches, "outliers")?,
        seed: parse_arg(matches, "seed")?,
    })
}

/// Parse the value of an argument that has a default value.
fn parse_arg<T>(matches: &clap::ArgMatches, name: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let value = matches
        .value_of(name)
        .with_context(|| format!("Missing value for --{}", name))?;
    value
        .parse()
        .with_context(|| format!("Invalid value {:?} for --{}", value, name))
}

/// Start actual program with command line arguments successfully parsed.
fn run(args: Args) -> anyhow::Result<()> {
    let Args {
        config,
        options,
        nb_points,
        nb_outliers,
        seed,
    } = args;
    let mut rng = StdRng::seed_from_u64(seed);
    let source = DMatrix::from_fn(nb_points, 3, |_, _| rng.random_range(-1.0..1.0));

    let truth = Transformation::Rigid {
        rotation: DMatrix::from_iterator(
            3,
            3,
            Rotation3::from_euler_angles(0.2, -0.1, 0.35)
                .matrix()
                .iter()
                .cloned(),
        ),
        translation: DVector::from_vec(vec![0.3, -0.1, 0.2]),
        scale: 1.1,
    };
    let mut target = truth.transform(&source);
    target.apply(|x| *x += rng.random_range(-NOISE..NOISE));
    let mut target = target.insert_rows(nb_points, nb_outliers, 0.0);
    for i in nb_points..nb_points + nb_outliers {
        for j in 0..3 {
            target[(i, j)] = rng.random_range(-3.0..3.0);
        }
    }

    for tf_type in ["rigid", "affine", "nonrigid"] {
        let registered = registration_cpd(&source, &target, tf_type, &config, &options)
            .with_context(|| format!("{} registration failed", tf_type))?;
        let moved = registered.result.transformation.transform(&source);
        let inliers = target.rows(0, nb_points);
        let rmse = ((moved - inliers).norm_squared() / nb_points as f64).sqrt();
        println!(
            "{:>8}: {:?} after {} iterations, sigma2 = {:.3e}, rmse = {:.4}",
            tf_type,
            registered.termination,
            registered.iterations,
            registered.result.sigma2,
            rmse
        );
        if let Transformation::Rigid {
            rotation,
            translation,
            scale,
        } = &registered.result.transformation
        {
            println!("          scale = {:.4}", scale);
            println!("          translation = {:.4}", translation.transpose());
            println!("          rotation = {:.4}", rotation);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args_from(argv: &[&str]) -> anyhow::Result<Args> {
        let matches = cli().get_matches_from_safe(argv)?;
        get_args(&matches)
    }

    #[test]
    fn defaults_feed_the_registration_parameters() {
        let args = args_from(&["synthetic"]).unwrap();
        assert_eq!(args.config.w, 0.1);
        assert_eq!(args.config.max_iterations, 100);
        assert_eq!(args.config.tolerance, 1e-6);
        assert_eq!((args.options.beta, args.options.lambda), (2.0, 2.0));
        assert_eq!((args.nb_points, args.nb_outliers, args.seed), (200, 10, 42));
    }

    #[test]
    fn arguments_override_defaults() {
        let args = args_from(&[
            "synthetic",
            "-vv",
            "--outlier-weight",
            "0.3",
            "--max-iterations",
            "7",
            "--tolerance",
            "1e-4",
            "--beta",
            "1.5",
            "--lambda",
            "10",
        ])
        .unwrap();
        assert_eq!(args.config.w, 0.3);
        assert_eq!(args.config.max_iterations, 7);
        assert_eq!(args.config.tolerance, 1e-4);
        assert_eq!((args.options.beta, args.options.lambda), (1.5, 10.0));

        let matches = cli().get_matches_from_safe(&["synthetic", "-vvv"]).unwrap();
        assert_eq!(matches.occurrences_of("verbose"), 3);
    }

    #[test]
    fn malformed_arguments_are_rejected() {
        assert!(args_from(&["synthetic", "--unknown"]).is_err());
        assert!(args_from(&["synthetic", "--max-iterations", "many"]).is_err());
        assert!(args_from(&["synthetic", "stray"]).is_err());
    }
}
