// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

mod common;

use anyhow::Result;
use catalog::{HasFile, StorageKind, Store, WantsFile};
use common::{ACQ, CopyBehavior, FakeCopy, Fleet, HOST, executor, test_config};
use std::sync::Arc;
use steward::transfer::{Blame, HardLink, TransferExecutor, TransferStrategy};
use steward::{CycleContext, RequestOutcome, SkipReason};

fn hard_links() -> TransferExecutor {
    let link: Arc<dyn TransferStrategy> = Arc::new(HardLink);
    TransferExecutor::new(vec![link], Vec::new())
}

#[tokio::test]
async fn test_local_request_is_linked_and_completed() -> Result<()> {
    let fleet = Fleet::new();
    let online = fleet.group("online").await;
    let dest_group = fleet.group("dest").await;
    let source = fleet.node("disk1", online, HOST, StorageKind::Regular).await;
    let dest = fleet.node("disk2", dest_group, HOST, StorageKind::Regular).await;

    let file = fleet.file_on(&source, "00000000_0000.h5", b"hello world\n").await;
    let req = fleet.request(&file, &source, dest_group).await;

    let steward = fleet.steward(test_config(None), hard_links());
    let mut ctx = CycleContext::new();
    let report = steward.process_requests(&dest, &mut ctx).await?;

    assert_eq!(report.not_started, None);
    assert_eq!(report.count(RequestOutcome::Transferred), 1);
    assert_eq!(
        std::fs::read(dest.copy_path(ACQ, "00000000_0000.h5"))?,
        b"hello world\n"
    );
    let copy = fleet.store.copy(file.id, dest.id).await?.expect("copy");
    assert_eq!(copy.has_file, HasFile::Yes);
    assert_eq!(copy.wants_file, WantsFile::Yes);
    assert!(fleet.completed(&req).await);
    assert!(!ctx.transport_done());
    Ok(())
}

/// Every open request for a file into the group completes with the first
/// successful transfer; later ones find the copy and complete again harmlessly.
#[tokio::test]
async fn test_duplicate_requests_complete_together() -> Result<()> {
    let fleet = Fleet::new();
    let online = fleet.group("online").await;
    let dest_group = fleet.group("dest").await;
    let src1 = fleet.node("disk1", online, HOST, StorageKind::Regular).await;
    let src2 = fleet.node("disk3", online, HOST, StorageKind::Regular).await;
    let dest = fleet.node("disk2", dest_group, HOST, StorageKind::Regular).await;

    let file = fleet.file_on(&src1, "a.h5", b"contents").await;
    fleet.copy(&file, &src2, HasFile::Yes, WantsFile::Yes).await;
    let first = fleet.request(&file, &src1, dest_group).await;
    let second = fleet.request(&file, &src2, dest_group).await;

    let copier = FakeCopy::new(CopyBehavior::Copy);
    let steward = fleet.steward(test_config(None), executor(copier.clone()));
    let report = steward
        .process_requests(&dest, &mut CycleContext::new())
        .await?;

    let outcomes: Vec<RequestOutcome> = report.outcomes.iter().map(|(_, o)| *o).collect();
    assert_eq!(
        outcomes,
        vec![RequestOutcome::Transferred, RequestOutcome::AlreadyPresent]
    );
    assert_eq!(copier.calls(), 1);
    assert!(fleet.completed(&first).await);
    assert!(fleet.completed(&second).await);

    // Nothing left to do on a second pass.
    let again = steward
        .process_requests(&dest, &mut CycleContext::new())
        .await?;
    assert!(again.outcomes.is_empty());
    assert_eq!(
        fleet
            .store
            .all_copies()
            .await
            .iter()
            .filter(|c| c.node_id == dest.id)
            .count(),
        1
    );
    Ok(())
}

#[tokio::test]
async fn test_hash_mismatch_removes_copy_and_flags_source() -> Result<()> {
    let fleet = Fleet::new();
    let online = fleet.group("online").await;
    let dest_group = fleet.group("dest").await;
    let source = fleet.node("disk1", online, HOST, StorageKind::Regular).await;
    let dest = fleet.node("disk2", dest_group, HOST, StorageKind::Regular).await;

    let file = fleet.file_on(&source, "a.h5", b"the real bytes").await;
    let req = fleet.request(&file, &source, dest_group).await;

    let copier = FakeCopy::new(CopyBehavior::Corrupt(b"garbage".to_vec()));
    let steward = fleet.steward(test_config(None), executor(copier));
    let report = steward
        .process_requests(&dest, &mut CycleContext::new())
        .await?;

    assert_eq!(report.count(RequestOutcome::HashMismatch), 1);
    assert!(!dest.copy_path(ACQ, "a.h5").exists());
    assert_eq!(fleet.has_file(&file, &source).await, Some(HasFile::MaybeCorrupt));
    assert_eq!(fleet.has_file(&file, &dest).await, None);
    assert!(!fleet.completed(&req).await);
    Ok(())
}

#[tokio::test]
async fn test_failure_blame_decides_source_suspicion() -> Result<()> {
    for (blame, expected) in [
        (Blame::Source, HasFile::MaybeCorrupt),
        (Blame::Destination, HasFile::Yes),
    ] {
        let fleet = Fleet::new();
        let online = fleet.group("online").await;
        let dest_group = fleet.group("dest").await;
        let source = fleet.node("disk1", online, HOST, StorageKind::Regular).await;
        let dest = fleet.node("disk2", dest_group, HOST, StorageKind::Regular).await;
        let file = fleet.file_on(&source, "a.h5", b"bytes").await;
        let req = fleet.request(&file, &source, dest_group).await;

        let steward = fleet.steward(
            test_config(None),
            executor(FakeCopy::new(CopyBehavior::Fail(blame))),
        );
        let report = steward
            .process_requests(&dest, &mut CycleContext::new())
            .await?;

        assert_eq!(
            report.outcomes[0].1,
            RequestOutcome::TransferFailed {
                source_suspect: blame == Blame::Source
            }
        );
        assert_eq!(fleet.has_file(&file, &source).await, Some(expected));
        assert!(!fleet.completed(&req).await);
    }
    Ok(())
}

#[tokio::test]
async fn test_transport_node_ignores_remote_sources() -> Result<()> {
    let fleet = Fleet::new();
    let online = fleet.group("online").await;
    let transport = fleet.group("transport").await;
    let remote = fleet.node("disk9", online, "host2", StorageKind::Regular).await;
    let dest = fleet.node("tr1", transport, HOST, StorageKind::Transport).await;

    let file = fleet.file_on(&remote, "a.h5", b"bytes").await;
    let req = fleet.request(&file, &remote, transport).await;

    let copier = FakeCopy::new(CopyBehavior::Copy);
    let steward = fleet.steward(test_config(None), executor(copier.clone()));
    let report = steward
        .process_requests(&dest, &mut CycleContext::new())
        .await?;

    assert_eq!(
        report.outcomes[0].1,
        RequestOutcome::Skipped(SkipReason::RemoteTransport)
    );
    assert_eq!(copier.calls(), 0);
    assert!(!fleet.completed(&req).await);
    Ok(())
}

#[tokio::test]
async fn test_one_transport_transfer_per_cycle() -> Result<()> {
    let fleet = Fleet::new();
    let online = fleet.group("online").await;
    let g1 = fleet.group("transport1").await;
    let g2 = fleet.group("transport2").await;
    let source = fleet.node("disk1", online, HOST, StorageKind::Regular).await;
    let tr1 = fleet.node("tr1", g1, HOST, StorageKind::Transport).await;
    let tr2 = fleet.node("tr2", g2, HOST, StorageKind::Transport).await;

    let file = fleet.file_on(&source, "a.h5", b"bytes").await;
    let _ = fleet.request(&file, &source, g1).await;
    let waiting = fleet.request(&file, &source, g2).await;

    let steward = fleet.steward(
        test_config(None),
        executor(FakeCopy::new(CopyBehavior::Copy)),
    );
    let mut ctx = CycleContext::new();
    let first = steward.process_requests(&tr1, &mut ctx).await?;
    assert_eq!(first.count(RequestOutcome::Transferred), 1);
    assert!(ctx.transport_done());

    let second = steward.process_requests(&tr2, &mut ctx).await?;
    assert_eq!(second.not_started, Some("transport done"));
    assert!(!fleet.completed(&waiting).await);

    // A fresh cycle lets the second transport node go.
    let third = steward
        .process_requests(&tr2, &mut CycleContext::new())
        .await?;
    assert_eq!(third.count(RequestOutcome::Transferred), 1);
    assert!(fleet.completed(&waiting).await);
    Ok(())
}

#[tokio::test]
async fn test_space_checks() -> Result<()> {
    let fleet = Fleet::new();
    let online = fleet.group("online").await;
    let dest_group = fleet.group("dest").await;
    let source = fleet.node("disk1", online, HOST, StorageKind::Regular).await;
    let dest = fleet.node("disk2", dest_group, HOST, StorageKind::Regular).await;

    // 6 GiB file, recorded only.
    let file = fleet.catalog_file("big.h5", 6 * 1_073_741_824).await;
    fleet.copy(&file, &source, HasFile::Yes, WantsFile::Yes).await;
    let req = fleet.request(&file, &source, dest_group).await;

    let copier = FakeCopy::new(CopyBehavior::Copy);
    let steward = fleet.steward(test_config(None), executor(copier.clone()));

    // Within the headroom: nothing starts.
    let dest = fleet.store.update_node(dest.id, |n| n.avail_gb = Some(5.0)).await?;
    let report = steward
        .process_requests(&dest, &mut CycleContext::new())
        .await?;
    assert_eq!(report.not_started, Some("nearly full"));

    // Enough to start, not twice the file size.
    let dest = fleet.store.update_node(dest.id, |n| n.avail_gb = Some(10.5)).await?;
    let report = steward
        .process_requests(&dest, &mut CycleContext::new())
        .await?;
    assert_eq!(
        report.outcomes[0].1,
        RequestOutcome::Skipped(SkipReason::InsufficientSpace)
    );
    assert_eq!(copier.calls(), 0);
    assert!(!fleet.completed(&req).await);
    assert_eq!(fleet.has_file(&file, &dest).await, None);
    Ok(())
}

#[tokio::test]
async fn test_unusable_sources_are_skipped() -> Result<()> {
    let fleet = Fleet::new();
    let online = fleet.group("online").await;
    let dest_group = fleet.group("dest").await;
    let inactive = fleet.node("disk1", online, HOST, StorageKind::Regular).await;
    let empty = fleet.node("disk3", online, HOST, StorageKind::Regular).await;
    let dest = fleet.node("disk2", dest_group, HOST, StorageKind::Regular).await;
    let _ = fleet.store.update_node(inactive.id, |n| n.active = false).await?;

    let a = fleet.file_on(&inactive, "a.h5", b"a").await;
    let b = fleet.catalog_file("b.h5", 1).await;
    fleet.copy(&b, &empty, HasFile::MaybeCorrupt, WantsFile::Yes).await;
    let _ = fleet.request(&a, &inactive, dest_group).await;
    let _ = fleet.request(&b, &empty, dest_group).await;

    let steward = fleet.steward(
        test_config(None),
        executor(FakeCopy::new(CopyBehavior::Copy)),
    );
    let report = steward
        .process_requests(&dest, &mut CycleContext::new())
        .await?;
    let outcomes: Vec<RequestOutcome> = report.outcomes.iter().map(|(_, o)| *o).collect();
    assert_eq!(
        outcomes,
        vec![
            RequestOutcome::Skipped(SkipReason::SourceInactive),
            RequestOutcome::Skipped(SkipReason::SourceMissing),
        ]
    );
    Ok(())
}

/// Lost connections while recording a finished transfer are retried.
#[tokio::test]
async fn test_bookkeeping_survives_transient_store_failures() -> Result<()> {
    let fleet = Fleet::new();
    let online = fleet.group("online").await;
    let dest_group = fleet.group("dest").await;
    let source = fleet.node("disk1", online, HOST, StorageKind::Regular).await;
    let dest = fleet.node("disk2", dest_group, HOST, StorageKind::Regular).await;
    let file = fleet.file_on(&source, "a.h5", b"bytes").await;
    let req = fleet.request(&file, &source, dest_group).await;

    let steward = fleet.steward(
        test_config(None),
        executor(FakeCopy::new(CopyBehavior::Copy)),
    );
    fleet.store.fail_next_begins(2);
    let report = steward
        .process_requests(&dest, &mut CycleContext::new())
        .await?;

    assert_eq!(report.count(RequestOutcome::Transferred), 1);
    assert_eq!(fleet.has_file(&file, &dest).await, Some(HasFile::Yes));
    assert!(fleet.completed(&req).await);
    Ok(())
}

/// Once the time budget is spent, the remaining requests wait for the next cycle.
#[tokio::test]
async fn test_spent_budget_defers_remaining_requests() -> Result<()> {
    let fleet = Fleet::new();
    let online = fleet.group("online").await;
    let dest_group = fleet.group("dest").await;
    let source = fleet.node("disk1", online, HOST, StorageKind::Regular).await;
    let dest = fleet.node("disk2", dest_group, HOST, StorageKind::Regular).await;

    let mut reqs = Vec::new();
    for name in ["a.h5", "b.h5", "c.h5"] {
        let file = fleet.file_on(&source, name, name.as_bytes()).await;
        reqs.push(fleet.request(&file, &source, dest_group).await);
    }

    let mut config = test_config(None);
    config.node_budget_secs = 0;
    let copier = FakeCopy::new(CopyBehavior::Copy);
    let steward = fleet.steward(config, executor(copier.clone()));
    let report = steward
        .process_requests(&dest, &mut CycleContext::new())
        .await?;

    // A transfer always takes measurable time, so at most one runs.
    assert!(report.deferred >= 2, "deferred {}", report.deferred);
    assert_eq!(report.outcomes.len() + report.deferred, reqs.len());
    assert!(copier.calls() <= 1);
    assert!(!fleet.completed(&reqs[2]).await);
    Ok(())
}
