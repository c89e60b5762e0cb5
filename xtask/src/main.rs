//! Build helper for ts-steer.
//!
//! The XDP program is a separate crate built on nightly for
//! `bpfel-unknown-none`; the daemon embeds nothing and reads the object from
//! `target/ts-steer-ebpf` at startup.
//!
//! Usage:
//!   cargo xtask build-ebpf [--release]
//!   cargo xtask build [--release]        # XDP program + daemon
//!   cargo xtask run [--release] -- <args> # Build everything and run

use std::path::PathBuf;
use std::process::Command;

use anyhow::{bail, Context, Result};
use clap::Parser;

#[derive(Parser)]
enum Cli {
    /// Build the XDP program only.
    BuildEbpf {
        /// Build in release mode.
        #[arg(long)]
        release: bool,
    },
    /// Build the XDP program and the daemon.
    Build {
        /// Build in release mode.
        #[arg(long)]
        release: bool,
    },
    /// Build everything and run the daemon.
    Run {
        /// Build in release mode.
        #[arg(long)]
        release: bool,
        /// Arguments passed through to ts-steer.
        #[arg(last = true)]
        args: Vec<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli {
        Cli::BuildEbpf { release } => {
            build_ebpf(release)?;
        }
        Cli::Build { release } => {
            build_ebpf(release)?;
            build_userspace(release)?;
        }
        Cli::Run { release, args } => {
            build_ebpf(release)?;
            build_userspace(release)?;
            run_daemon(release, &args)?;
        }
    }

    Ok(())
}

fn workspace_root() -> Result<PathBuf> {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .map(|p| p.to_path_buf())
        .context("xtask must live one level below the workspace root")
}

fn profile(release: bool) -> &'static str {
    if release {
        "release"
    } else {
        "debug"
    }
}

/// Build the XDP program.
///
/// This requires:
/// - `bpf-linker` installed: `cargo install bpf-linker`
/// - Nightly Rust for the BPF target: `rustup toolchain install nightly`
/// - BPF target: `rustup target add bpfel-unknown-none --toolchain nightly`
fn build_ebpf(release: bool) -> Result<()> {
    let root = workspace_root()?;
    let ebpf_dir = root.join("ts-steer-ebpf");

    println!("=> Building XDP program...");

    let mut cmd = Command::new("cargo");
    cmd.current_dir(&ebpf_dir)
        .arg("+nightly")
        .arg("build")
        .arg("--target=bpfel-unknown-none")
        .arg("-Z")
        .arg("build-std=core");

    if release {
        cmd.arg("--release");
    }

    let status = cmd.status().context("running cargo build for the XDP program")?;

    if !status.success() {
        bail!("XDP program build failed");
    }

    let ebpf_binary = ebpf_dir
        .join("target")
        .join("bpfel-unknown-none")
        .join(profile(release))
        .join("ts-steer-ebpf");
    if !ebpf_binary.exists() {
        bail!("XDP object not found at {}", ebpf_binary.display());
    }

    let target_dir = root.join("target");
    std::fs::create_dir_all(&target_dir)
        .with_context(|| format!("creating {}", target_dir.display()))?;

    let dest = target_dir.join("ts-steer-ebpf");
    std::fs::copy(&ebpf_binary, &dest).with_context(|| {
        format!(
            "copying XDP object from {} to {}",
            ebpf_binary.display(),
            dest.display()
        )
    })?;

    println!("   XDP object: {}", dest.display());
    Ok(())
}

/// Build the control-plane daemon.
fn build_userspace(release: bool) -> Result<()> {
    let root = workspace_root()?;

    println!("=> Building ts-steer...");

    let mut cmd = Command::new("cargo");
    cmd.current_dir(&root).arg("build").arg("-p").arg("ts-steer");

    if release {
        cmd.arg("--release");
    }

    let status = cmd.status().context("running cargo build for ts-steer")?;

    if !status.success() {
        bail!("ts-steer build failed");
    }

    Ok(())
}

/// Run the daemon against the freshly built XDP object.
fn run_daemon(release: bool, extra_args: &[String]) -> Result<()> {
    let root = workspace_root()?;
    let binary = root.join("target").join(profile(release)).join("ts-steer");
    let ebpf_program = root.join("target").join("ts-steer-ebpf");

    println!("=> Running ts-steer (XDP attach needs CAP_NET_ADMIN and CAP_BPF)...");

    let status = Command::new(&binary)
        .arg("--ebpf-program")
        .arg(&ebpf_program)
        .args(extra_args)
        .status()
        .context("running ts-steer")?;

    if !status.success() {
        bail!("ts-steer exited with {}", status);
    }

    Ok(())
}
