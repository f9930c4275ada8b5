// Copyright 2023 Oxide Computer Company
use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;
use sep_common::{build_bunyan_logger, build_logger, write_json};
use sep_harness::{TestSession, TestSessionConfig};
use slog::{info, o};

mod workload;
use workload::*;

#[derive(Debug, Parser, PartialEq)]
#[clap(name = "workload", term_width = 80)]
#[clap(about = "Workload the program will execute.", long_about = None)]
enum Workload {
    /// Pull a RAID5 member, put it back, and wait for the rebuild
    Degraded,
    /// Quiesce a RAID10 and check both mirrors report it
    Raid10Quiesce,
    /// Try to destroy a raid group that still has a LUN bound
    DestroyWithLuns,
    /// Run every verify type on a fresh raid group
    Verify,
    /// Cut and restore the SP link while a verify runs
    PeerSync,
    /// Pull and reinsert random positions, checking degraded state
    /// against what was pulled each time
    Random {
        /// Number of pull/reinsert rounds
        #[clap(long, default_value = "10", action)]
        count: usize,
    },
    /// Run everything above, one after the other
    All,
}

#[derive(Debug, Parser)]
#[clap(name = "septest", term_width = 80)]
#[clap(
    about = "Raid group background operation test driver",
    long_about = None
)]
pub struct Opt {
    /// TOML file with session settings; flags below override it
    #[clap(long, global = true, value_name = "FILE", action)]
    config: Option<PathBuf>,

    /// Run two SPs with a link between them
    #[clap(long, global = true, action)]
    dualsp: bool,

    /// Inject media errors where the workload supports it
    #[clap(long, global = true, action)]
    error_injection: bool,

    /// Chunks each background operation covers per monitor cycle (1-10)
    #[clap(long, global = true, action)]
    chunks_per_rebuild: Option<u32>,

    /// Seed for random position selection
    #[clap(long, global = true, action)]
    seed: Option<u64>,

    /// Log bunyan JSON to stdout instead of the terminal format
    #[clap(long, global = true, action)]
    json: bool,

    /// Write a JSON summary of the run to this file
    #[clap(long, global = true, value_name = "FILE", action)]
    report: Option<PathBuf>,

    /// A test workload that septest will execute.
    #[clap(subcommand)]
    workload: Workload,
}

pub fn opts() -> Result<Opt> {
    let opt: Opt = Opt::parse();
    Ok(opt)
}

fn session_config(opt: &Opt) -> Result<TestSessionConfig> {
    let mut cfg = match &opt.config {
        Some(path) => TestSessionConfig::from_file(path)?,
        None => TestSessionConfig::default(),
    };
    cfg.dualsp |= opt.dualsp;
    cfg.error_injection |= opt.error_injection;
    if let Some(c) = opt.chunks_per_rebuild {
        cfg.chunks_per_rebuild = c;
    }
    if let Some(s) = opt.seed {
        cfg.seed = s;
    }
    Ok(cfg)
}

#[tokio::main]
async fn main() -> Result<()> {
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(1);
    }));

    let opt = opts()?;
    let cfg = session_config(&opt)?;
    if opt.workload == Workload::PeerSync && !cfg.dualsp {
        bail!("peer-sync needs --dualsp");
    }

    let log = if opt.json {
        build_bunyan_logger("septest")
    } else {
        build_logger()
    };
    let log = log.new(o!("workload" => format!("{:?}", opt.workload)));

    let mut session = TestSession::start(cfg, &log)?;
    let mut report = RunReport::new(&session);

    match opt.workload {
        Workload::Degraded => {
            println!("Run degraded test");
            degraded_workload(&mut session, &mut report).await?;
        }
        Workload::Raid10Quiesce => {
            println!("Run RAID10 quiesce test");
            raid10_quiesce_workload(&mut session, &mut report).await?;
        }
        Workload::DestroyWithLuns => {
            println!("Run destroy with LUNs test");
            destroy_with_luns_workload(&mut session, &mut report).await?;
        }
        Workload::Verify => {
            println!("Run verify test");
            verify_workload(&mut session, &mut report).await?;
        }
        Workload::PeerSync => {
            println!("Run peer sync test");
            peer_sync_workload(&mut session, &mut report).await?;
        }
        Workload::Random { count } => {
            println!("Run random removal test, {} rounds", count);
            random_workload(&mut session, &mut report, count).await?;
        }
        Workload::All => {
            println!("Run all tests");
            degraded_workload(&mut session, &mut report).await?;
            raid10_quiesce_workload(&mut session, &mut report).await?;
            destroy_with_luns_workload(&mut session, &mut report).await?;
            verify_workload(&mut session, &mut report).await?;
            if session.cfg.dualsp {
                peer_sync_workload(&mut session, &mut report).await?;
            }
            random_workload(&mut session, &mut report, 10).await?;
        }
    }

    info!(log, "workload done"; "report" => ?report);
    if let Some(path) = &opt.report {
        write_json(path, &report, true)?;
    }
    session.shutdown().await;
    Ok(())
}
