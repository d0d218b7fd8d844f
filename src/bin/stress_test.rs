//! repohost Stress Test Binary
//!
//! Drives many concurrent record writes through the full pipeline while a
//! firehose subscriber watches, then checks the log's ordering guarantees.
//! Run with: `cargo run --bin stress_test -- [OPTIONS]`
//!
//! # Examples
//!
//! ```bash
//! # Default: 20 repositories, 2000 writes, 16 concurrent tasks
//! cargo run --release --bin stress_test
//!
//! # Same-repository contention
//! cargo run --release --bin stress_test -- --same-repo --writes 500 --concurrency 20
//!
//! # With logs
//! RUST_LOG=repohost=debug cargo run --bin stress_test
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use repohost::{
    CreateRecordInput, Did, EventBody, Frame, HostConfig, MemoryKeystore, RepoHost, Seq, Tid,
};

/// How long the verifier waits for the firehose to drain after the writes.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "stress_test", about = "Concurrent write and firehose stress test")]
struct Args {
    /// Number of repositories to write to
    #[arg(short, long, default_value_t = 20)]
    repos: usize,

    /// Total number of record writes
    #[arg(short, long, default_value_t = 2000)]
    writes: usize,

    /// Number of concurrent writer tasks
    #[arg(short, long, default_value_t = 16)]
    concurrency: usize,

    /// Send every write to one repository
    #[arg(long)]
    same_repo: bool,

    /// Database path (default: a file in the system temp directory)
    #[arg(short, long)]
    db: Option<PathBuf>,
}

/// What the firehose subscriber saw.
#[derive(Default)]
struct Observed {
    seqs: Vec<u64>,
    revs: HashMap<Did, Vec<Tid>>,
    commits: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let concurrency = args.concurrency.max(1);
    let repo_count = if args.same_repo { 1 } else { args.repos.max(1) };

    let db_path = match &args.db {
        Some(path) => path.clone(),
        None => {
            let dir = std::env::temp_dir().join(format!("repohost-stress-{}", std::process::id()));
            std::fs::create_dir_all(&dir)?;
            dir.join("stress.db")
        }
    };
    info!(
        db = %db_path.display(),
        repos = repo_count,
        writes = args.writes,
        concurrency,
        "starting stress test"
    );

    let host = RepoHost::open(&db_path, Arc::new(MemoryKeystore::new()), HostConfig::from_env()).await?;

    let cancel = CancellationToken::new();
    let start_seq = host.current_seq().unwrap_or(Seq::ZERO);
    let mut subscription = host.subscribe_repos(Some(start_seq.as_raw()), cancel.clone()).await?;
    let last_seen = Arc::new(AtomicU64::new(start_seq.as_raw()));
    let verifier_seen = Arc::clone(&last_seen);
    let verifier = tokio::spawn(async move {
        let mut observed = Observed::default();
        while let Some(frame) = subscription.next_frame().await {
            let event = match frame {
                Ok(Frame::Event(event)) => event,
                Ok(Frame::Info { .. }) => continue,
                Err(e) => {
                    warn!(error = %e, "firehose ended with an error");
                    break;
                }
            };
            observed.seqs.push(event.seq.as_raw());
            verifier_seen.store(event.seq.as_raw(), Ordering::Relaxed);
            if let EventBody::Commit(commit) = &event.body {
                observed.commits += 1;
                observed.revs.entry(commit.repo.clone()).or_default().push(commit.rev);
            }
        }
        observed
    });

    let dids: Vec<Did> = (0..repo_count)
        .map(|i| Did::parse(format!("did:example:stress{i}")))
        .collect::<repohost::Result<_>>()?;
    for did in &dids {
        host.create_repo(did).await?;
    }

    let accepted = Arc::new(AtomicU64::new(0));
    let conflicts = Arc::new(AtomicU64::new(0));
    let errors = Arc::new(AtomicU64::new(0));
    let dids = Arc::new(dids);

    let started = Instant::now();
    let per_task = args.writes / concurrency;
    let mut tasks = Vec::with_capacity(concurrency);
    for task_id in 0..concurrency {
        let host = host.clone();
        let dids = Arc::clone(&dids);
        let accepted = Arc::clone(&accepted);
        let conflicts = Arc::clone(&conflicts);
        let errors = Arc::clone(&errors);

        tasks.push(tokio::spawn(async move {
            for i in 0..per_task {
                let did = &dids[(task_id * per_task + i) % dids.len()];
                let input = CreateRecordInput {
                    repo: did.clone(),
                    collection: "app.example.post".to_string(),
                    rkey: None,
                    record: json!({ "text": format!("stress {task_id}-{i}") }),
                    swap_commit: None,
                    validate: None,
                };
                match host.create_record(did, input).await {
                    Ok(out) if out.commit.is_some() => {
                        accepted.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(_) => {}
                    Err(e) if e.is_conflict() => {
                        conflicts.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        warn!(error = %e, "write failed");
                        errors.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }));
    }
    for task in tasks {
        task.await?;
    }
    let elapsed = started.elapsed();

    // Let the subscriber catch up with everything that was sequenced.
    let target = host.current_seq().unwrap_or(Seq::ZERO);
    let drained = Instant::now();
    while last_seen.load(Ordering::Relaxed) < target.as_raw()
        && !verifier.is_finished()
        && drained.elapsed() < DRAIN_TIMEOUT
    {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cancel.cancel();
    let observed = verifier.await?;

    let accepted = accepted.load(Ordering::Relaxed);
    println!();
    println!("Results");
    println!("-------");
    println!("Writes accepted: {accepted}");
    println!("Conflicts:       {}", conflicts.load(Ordering::Relaxed));
    println!("Errors:          {}", errors.load(Ordering::Relaxed));
    println!("Duration:        {elapsed:?}");
    println!(
        "Throughput:      {:.2} commits/sec",
        accepted as f64 / elapsed.as_secs_f64()
    );
    println!();

    let mut failures = Vec::new();

    // Gapless, strictly increasing sequence numbers.
    for (i, seq) in observed.seqs.iter().enumerate() {
        let expected = start_seq.as_raw() + 1 + i as u64;
        if *seq != expected {
            failures.push(format!("seq gap: expected {expected}, got {seq}"));
            break;
        }
    }
    if observed.seqs.last().copied() != Some(target.as_raw()) && target > start_seq {
        failures.push(format!(
            "firehose stopped at {:?}, log head is {}",
            observed.seqs.last(),
            target
        ));
    }

    // Per-repository revisions strictly increase in log order.
    for (did, revs) in &observed.revs {
        if revs.windows(2).any(|pair| pair[0] >= pair[1]) {
            failures.push(format!("revisions out of order for {did}"));
        }
    }

    // One commit event per created repository plus one per accepted write.
    let expected_commits = repo_count as u64 + accepted;
    if observed.commits != expected_commits {
        failures.push(format!(
            "commit events: expected {expected_commits}, observed {}",
            observed.commits
        ));
    }

    host.shutdown().await;

    println!("Verifying invariants...");
    println!("  Events observed:   {}", observed.seqs.len());
    println!("  Repositories:      {}", observed.revs.len());
    if failures.is_empty() {
        println!("  Sequence numbers:  gapless ✓");
        println!("  Revisions:         increasing per repository ✓");
        println!("  Commit events:     {} ✓", observed.commits);
        println!();
        println!("Stress test PASSED ✓");
        Ok(())
    } else {
        for failure in &failures {
            println!("  ✗ {failure}");
        }
        Err(format!("{} invariant(s) violated", failures.len()).into())
    }
}
