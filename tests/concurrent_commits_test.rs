mod common;

use std::collections::{HashMap, HashSet};

use common::{create_input, did, post, TestHost};
use repohost::{EventBody, Seq, Tid};
use tokio_util::sync::CancellationToken;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writes_to_one_repo_get_distinct_increasing_revs() {
    let t = TestHost::start().await;
    let alice = did("alice");
    let genesis = t.host.create_repo(&alice).await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..40 {
        let host = t.host.clone();
        let alice = alice.clone();
        tasks.push(tokio::spawn(async move {
            host.create_record(&alice, create_input(&alice, None, post(&format!("p{i}"))))
                .await
                .unwrap()
                .commit
                .unwrap()
                .rev
        }));
    }

    let mut revs: Vec<Tid> = Vec::new();
    for task in tasks {
        revs.push(task.await.unwrap());
    }
    let unique: HashSet<_> = revs.iter().copied().collect();
    assert_eq!(unique.len(), revs.len());
    assert!(revs.iter().all(|rev| *rev > genesis.commit.rev));

    let head = t.host.get_head(&alice).await.unwrap().unwrap();
    assert_eq!(Some(&head.rev), revs.iter().max());
    t.host.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn log_order_matches_commit_order_per_repo() {
    let t = TestHost::start().await;
    let repos: Vec<_> = (0..4).map(|i| did(&format!("user{i}"))).collect();
    for repo in &repos {
        t.host.create_repo(repo).await.unwrap();
    }

    let mut tasks = Vec::new();
    for (i, repo) in repos.iter().enumerate() {
        for j in 0..10 {
            let host = t.host.clone();
            let repo = repo.clone();
            tasks.push(tokio::spawn(async move {
                host.create_record(&repo, create_input(&repo, None, post(&format!("{i}-{j}"))))
                    .await
                    .unwrap();
            }));
        }
    }
    for task in tasks {
        task.await.unwrap();
    }

    let mut sub = t
        .host
        .subscribe_repos(Some(0), CancellationToken::new())
        .await
        .unwrap();
    let total = t.host.current_seq().unwrap().as_raw();
    assert_eq!(total, 4 + 40);

    let mut last_seq = Seq::ZERO;
    let mut revs: HashMap<_, Vec<Tid>> = HashMap::new();
    for _ in 0..total {
        let event = common::next_event(&mut sub).await;
        assert!(event.seq > last_seq);
        last_seq = event.seq;
        if let EventBody::Commit(commit) = &event.body {
            revs.entry(commit.repo.clone()).or_default().push(commit.rev);
        }
    }

    assert_eq!(revs.len(), 4);
    for (repo, revs) in revs {
        assert_eq!(revs.len(), 11, "{repo}");
        assert!(revs.windows(2).all(|w| w[0] < w[1]), "revs out of order for {repo}");
        let head = t.host.get_head(&repo).await.unwrap().unwrap();
        assert_eq!(head.rev, *revs.last().unwrap());
    }
    t.host.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sequence_numbers_are_gapless_under_mixed_load() {
    let t = TestHost::start().await;
    let alice = did("alice");
    t.host.create_repo(&alice).await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..20 {
        let host = t.host.clone();
        let alice = alice.clone();
        tasks.push(tokio::spawn(async move {
            if i % 2 == 0 {
                host.create_record(&alice, create_input(&alice, None, post("x")))
                    .await
                    .unwrap();
            } else {
                host.sequence_identity(&alice, Some(format!("alice{i}.test")))
                    .await
                    .unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let seqs = common::stored_seqs(&t.path);
    assert_eq!(seqs, (1..=21).collect::<Vec<u64>>());
    assert_eq!(t.host.current_seq(), Some(Seq::from_raw(21)));
    t.host.shutdown().await;
}
