use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use std::fs;
use std::path::Path;

use mdstress::array::{ArrayController, MdArray};
use mdstress::artifact::FileArtifact;
use mdstress::bench::FioRunner;
use mdstress::cli::{ArrayArgs, Cli, Commands, IntegrityArgs, SweepArgs};
use mdstress::config::{format_size, ArrayConfiguration};
use mdstress::error::{self, HarnessError};
use mdstress::funccount::FuncCount;
use mdstress::logging::{AnnotationSink, KmsgSink, NullSink};
use mdstress::report::{report_args, SweepReport};
use mdstress::session::{ensure_privileges, IntegritySession};
use mdstress::sim::SimArray;
use mdstress::sweep::PerfSweepEngine;

fn main() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let cli = Cli::parse();

    if let Err(e) = error::install_interrupt_handler() {
        log::warn!("Failed to install interrupt handler: {}", e);
    }

    let result = match &cli.command {
        Commands::Integrity(args) => cmd_integrity(args, cli.json),
        Commands::Sweep(args) => cmd_sweep(args, cli.json),
        Commands::Report { input } => cmd_report(input, cli.json),
    };

    if let Err(err) = result {
        std::process::exit(exit_with(&err, cli.json));
    }
}

/// Print the failure and pick the exit status
fn exit_with(err: &anyhow::Error, json_output: bool) -> i32 {
    let code = err
        .downcast_ref::<HarnessError>()
        .map(HarnessError::exit_code)
        .unwrap_or(1);

    if matches!(err.downcast_ref::<HarnessError>(), Some(HarnessError::Interrupted)) {
        // leave the shell prompt off the ^C line
        println!();
        return code;
    }

    if json_output {
        println!(
            "{}",
            json!({
                "error": {
                    "message": format!("{:#}", err),
                    "code": code
                },
                "timestamp": chrono::Utc::now().to_rfc3339()
            })
        );
    } else {
        eprintln!("Error: {:#}", err);
    }
    code
}

fn controller(args: &ArrayArgs, config: ArrayConfiguration) -> Result<Box<dyn ArrayController>> {
    if args.sim {
        return Ok(Box::new(SimArray::new(config)?));
    }
    let mut md = MdArray::new(&args.md, config);
    if let Some(special) = &args.special_disk {
        md = md.with_special_disk(special.clone());
    }
    Ok(Box::new(md))
}

fn annotation_sink(path: &Path) -> Box<dyn AnnotationSink> {
    match KmsgSink::open(path) {
        Ok(sink) => Box::new(sink),
        Err(e) => {
            log::warn!("TEST annotations disabled: {:#}", e);
            Box::new(NullSink)
        }
    }
}

fn cmd_integrity(args: &IntegrityArgs, json_output: bool) -> Result<()> {
    let config = args.to_config()?;
    let mut ctrl = controller(&args.array, config.array.clone())?;

    if !json_output {
        println!(
            "Integrity run on {} {} disks, chunk {}, {} random writes per phase{}",
            config.array.level,
            config.array.disk_count(),
            format_size(config.array.chunk_size),
            config.integrity.count,
            if config.integrity.quick { " (quick)" } else { "" }
        );
    }

    let sink = if args.array.sim {
        Box::new(NullSink) as Box<dyn AnnotationSink>
    } else {
        annotation_sink(&args.kmsg)
    };
    let session = IntegritySession::new(
        ctrl.as_mut(),
        config.integrity.clone(),
        sink,
        FileArtifact::new(&args.artifact),
    );
    let (summary, _, _) = session.run()?;

    if json_output {
        println!(
            "{}",
            json!({
                "status": "success",
                "level": config.array.level.to_string(),
                "disks": ctrl.get_disks()?,
                "writes": summary.writes,
                "bytes": summary.bytes,
                "verified_bytes": summary.verified_bytes,
                "timestamp": chrono::Utc::now().to_rfc3339()
            })
        );
    } else {
        println!("✓ {} writes ({} bytes) read back intact", summary.writes, summary.bytes);
        if let Some(bytes) = summary.verified_bytes {
            println!("✓ first {} bytes match the reference disk", bytes);
        }
    }
    Ok(())
}

fn cmd_sweep(args: &SweepArgs, json_output: bool) -> Result<()> {
    if args.array.sim {
        return Err(HarnessError::Precondition(
            "fio needs a real block device; sweep cannot run with --sim".to_string(),
        )
        .into());
    }
    let config = args.to_config()?;
    let mut md = MdArray::new(&args.array.md, config.array.clone());
    ensure_privileges(&md)?;

    let target = md.device().display().to_string();
    let runner = FioRunner::new(md.device(), config.fio.clone());
    let mut engine = PerfSweepEngine::new(config.sweep.clone(), config.fio.size, runner);
    if !config.funccount.functions.is_empty() {
        engine = engine.with_call_counter(FuncCount::new(&config.funccount)?);
    }
    if !json_output {
        println!("Sweeping {} ({} fio runs)", target, engine.planned());
    }

    let records = engine.run(&mut md)?;
    let report = SweepReport::new(report_args(&config, &target), records);
    let doc = report.to_json();

    if let Some(path) = &args.output {
        let text = serde_json::to_string_pretty(&doc)?;
        fs::write(path, text).with_context(|| format!("Failed to write report {:?}", path))?;
        log::info!("report saved to {}", path.display());
    }

    if json_output {
        println!("{}", serde_json::to_string_pretty(&doc)?);
    } else {
        print!("{}", report.render_table());
    }
    Ok(())
}

fn cmd_report(input: &Path, json_output: bool) -> Result<()> {
    let text = fs::read_to_string(input).with_context(|| format!("Failed to read {:?}", input))?;
    let report = SweepReport::from_json(&text)?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&report.to_json())?);
    } else {
        print!("{}", report.render_table());
    }
    Ok(())
}
