// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Region-manager fault demo: a parent resolves the page faults of a child domain
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Scenario covered by tests/rm_fault_e2e
//!
//! FLOW:
//!   - child reads MANAGED_ADDR, faults, then keeps incrementing the word there
//!   - parent shares one page pre-written with 0x1234, waits for the child to
//!     modify it, revokes the page and repeats for `--rounds` rounds
//!
//! DEPENDENCIES:
//!   - nexus-rm: region maps, signals, fault handler
//!   - clap: command line
//!   - env_logger: log output (RUST_LOG, default `info`)

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use nexus_rm::{
    Attach, DataspaceAllocator, DomainConfig, DomainThread, Error, FaultHandler, Outcome, Platform,
    ProtectionDomain, RamAccount, RmConfig, SharedBacking, Wait,
};

const MANAGED_ADDR: usize = 0x1000_0000;
const INITIAL_VALUE: u32 = 0x1234;
const PARENT_QUOTA: usize = 4 * 1024 * 1024;
const CHILD_QUOTA: usize = 1024 * 1024;

#[derive(Parser)]
#[command(name = "rm-fault")]
#[command(about = "Raise and resolve region-map faults between a parent and a child domain")]
struct Args {
    /// Number of fault/resolve/revoke rounds
    #[arg(short, long, default_value_t = 4)]
    rounds: u32,

    /// Platform configuration (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// How long to wait for the child to modify the shared page, in milliseconds
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    log::info!("--- region-manager fault test ---");
    match run(&args) {
        Ok(()) => {
            log::info!("--- parent role of region-manager fault test finished ---");
            ExitCode::SUCCESS
        }
        Err(err) => {
            log::error!("rm-fault: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<(), Error> {
    let config = match &args.config {
        Some(path) => RmConfig::load(path)?,
        None => RmConfig::default(),
    };
    let platform = Platform::new(config)?;
    let page_size = platform.config().page_size;

    let ram = Arc::new(RamAccount::new(platform.clone(), PARENT_QUOTA));
    let child_ram = RamAccount::new(platform.clone(), 0);
    ram.transfer_quota(&child_ram, CHILD_QUOTA)?;

    let parent = ProtectionDomain::create(platform.clone(), DomainConfig::new("parent"))?;
    let image = platform.rom(b"rmchild")?;
    let child = ProtectionDomain::create(platform.clone(), DomainConfig::new("rmchild").image(image))?;

    // Shared page, also mapped into the parent so it can observe the child's writes.
    let ds = ram.alloc(page_size)?;
    let local_addr = parent.region_map().attach(Attach::new(ds))?;
    let local = parent.thread();

    let mut handler = FaultHandler::new(platform.clone(), child.address_space(), SharedBacking::new(ds))?;
    child.start(child_role)?;

    let timeout = Duration::from_millis(args.timeout_ms);
    let mut round = 0;
    while round < args.rounds {
        local.write_u32(local_addr, INITIAL_VALUE)?;
        log::info!("wait for region-manager fault");
        match handler.handle_next(Wait::Blocking)? {
            Outcome::Spurious => {
                log::info!("ignoring spurious fault signal");
                continue;
            }
            Outcome::Resolved { fault, page, .. } => {
                log::info!("rm state is {fault}, attached dataspace to the child at {page:#x}");
                let value = wait_for_change(&local, local_addr, timeout)?;
                log::info!("child modified dataspace content, new value is {value:#x}");
                log::info!("revoke dataspace from child");
                handler.revoke(page)?;
            }
            Outcome::AlreadyResolved { .. } => continue,
            Outcome::Skipped { reason, .. } => return Err(reason),
        }
        round += 1;
    }

    log::info!("handler stats: {:?}", handler.stats());
    drop(handler);
    drop(child);
    Ok(())
}

fn wait_for_change(local: &DomainThread, addr: usize, timeout: Duration) -> Result<u32, Error> {
    let deadline = Instant::now() + timeout;
    loop {
        let value = local.read_u32(addr)?;
        if value != INITIAL_VALUE {
            return Ok(value);
        }
        if Instant::now() >= deadline {
            return Err(Error::Timeout);
        }
        thread::sleep(Duration::from_millis(1));
    }
}

fn child_role(thread: DomainThread) -> Result<(), Error> {
    log::info!("child role started");
    log::info!("perform read operation at {MANAGED_ADDR:#x}");
    let value = thread.read_u32(MANAGED_ADDR)?;
    log::info!("read value {value:#x}");
    loop {
        let value = thread.read_u32(MANAGED_ADDR)?.wrapping_add(1);
        thread.write_u32(MANAGED_ADDR, value)?;
        log::debug!("modify memory at {MANAGED_ADDR:#x} to {value:#x}");
    }
}
