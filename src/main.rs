use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use colored::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use skill_evolver::cli::{log_directive, Args, Command};
use skill_evolver::{Config, Engine, EvolveError, MutationReport};

const EXIT_INTERRUPTED: u8 = 130;

fn init_tracing(args: &Args) {
    let directive = log_directive(args.verbose, args.quiet);
    let filter = if args.quiet {
        EnvFilter::new(directive)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive))
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn print_json<T: Serialize>(value: &T) -> Result<(), EvolveError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn rng_for(seed: Option<u64>) -> StdRng {
    match seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_entropy(),
    }
}

fn describe(report: &MutationReport) {
    let verdict = if report.adopted {
        "adopted".green().bold()
    } else {
        "kept baseline".yellow().bold()
    };
    eprintln!(
        "{} {}: {} ({}/{} candidates compiled)",
        "mutate".bright_cyan(),
        report.skill,
        verdict,
        report.candidates_compiled,
        report.candidates_tried
    );
}

/// Returns `Ok(false)` when the command ran but the answer is negative
/// (a seal mismatch), which maps to exit code 1.
async fn run(args: Args) -> Result<bool, EvolveError> {
    let config = Config::load(args.config.as_deref(), &args.workspace)?;
    let engine = Arc::new(Engine::open(&args.workspace, config)?);

    match args.command {
        Command::Mutate { skill, trials, seed } => {
            let engine = engine.clone();
            let report = tokio::task::spawn_blocking(move || {
                engine.request_mutation_with(&skill, trials, &mut rng_for(seed))
            })
            .await
            .map_err(|e| EvolveError::Task(e.to_string()))??;
            describe(&report);
            print_json(&report)?;
        }
        Command::EvalSkill { skill } => print_json(&engine.eval_skill(&skill)?)?,
        Command::Feedback { label } => {
            let weights = engine.feedback(label)?;
            print_json(&serde_json::json!({ "label": label, "weights": weights }))?;
        }
        Command::MetaPolicy => print_json(&engine.meta_policy())?,
        Command::MetaRun { episodes, seed } => {
            let engine = engine.clone();
            let report = tokio::task::spawn_blocking(move || engine.meta_run(episodes, &mut rng_for(seed)))
                .await
                .map_err(|e| EvolveError::Task(e.to_string()))??;
            let headline = if report.adopted_any { "improved".green() } else { "no adoption".yellow() };
            eprintln!("{} {} episodes: {}", "meta-run".bright_cyan(), report.episodes.len(), headline);
            print_json(&report)?;
        }
        Command::MetaReset => print_json(&engine.meta_reset()?)?,
        Command::SealInit { phrase } => {
            let record = engine.seal_init(&phrase)?;
            eprintln!("{} seal created", "ok".green().bold());
            print_json(&serde_json::json!({
                "kdf": record.kdf,
                "iterations": record.iterations,
                "created_at": record.created_at,
            }))?;
        }
        Command::SealCheck { phrase } => {
            let ok = engine.seal_check(&phrase)?;
            print_json(&serde_json::json!({ "ok": ok }))?;
            return Ok(ok);
        }
        Command::SealStatus => print_json(&engine.seal_status())?,
        Command::Skills => print_json(&engine.skills())?,
        Command::History { skill } => print_json(&engine.history(skill.as_deref())?)?,
        Command::RunSkill { skill, text, max_len } => {
            println!("{}", engine.run_skill_with(&skill, &text, max_len)?);
        }
        Command::Chat { prompt, mode, seal_phrase } => {
            let reply = engine.chat(&prompt, mode, seal_phrase.as_deref())?;
            println!("{}", reply.output);
            if let Some(skill) = reply.turn.mutation_requested {
                let report = engine.clone().spawn_mutation(skill, None).await?;
                describe(&report);
            }
        }
    }
    Ok(true)
}

/// Shut down without joining an in-flight mutation on the blocking pool; it
/// is dropped with the process. Every file it may touch is replaced
/// atomically, so each is left either old or new.
fn abandon(runtime: tokio::runtime::Runtime) {
    runtime.shutdown_background();
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(&args);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{} cannot start runtime: {}", "error:".red().bold(), e);
            return ExitCode::FAILURE;
        }
    };
    let outcome = runtime.block_on(async {
        tokio::select! {
            res = run(args) => Some(res),
            _ = tokio::signal::ctrl_c() => None,
        }
    });

    match outcome {
        Some(Ok(true)) => ExitCode::SUCCESS,
        Some(Ok(false)) => ExitCode::from(1),
        Some(Err(e)) => {
            eprintln!("{} {}", "error:".red().bold(), e);
            if e.is_retryable() {
                eprintln!("{}", "the workspace is busy; retry shortly".dimmed());
            }
            ExitCode::from(e.exit_code() as u8)
        }
        None => {
            eprintln!("{}", "interrupted".red());
            abandon(runtime);
            ExitCode::from(EXIT_INTERRUPTED)
        }
    }
}
