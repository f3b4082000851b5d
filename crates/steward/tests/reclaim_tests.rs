// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

mod common;

use anyhow::Result;
use catalog::{HasFile, StorageKind, Store, WantsFile};
use common::{ACQ, CopyBehavior, FakeCopy, Fleet, HOST, executor, test_config};

/// A copy only goes once two verified archive copies exist on other nodes.
#[tokio::test]
async fn test_deletion_keeps_last_archive_replicas() -> Result<()> {
    let fleet = Fleet::new();
    let online = fleet.group("online").await;
    let archive = fleet.group("archive").await;
    let disk = fleet.node("disk1", online, HOST, StorageKind::Regular).await;
    let arc1 = fleet.node("arc1", archive, "host2", StorageKind::Archive).await;
    let arc2 = fleet.node("arc2", archive, "host3", StorageKind::Archive).await;

    let file = fleet.file_on(&disk, "00000000_0000.h5", b"payload").await;
    let _ = fleet.store.set_wants_file(file.id, disk.id, WantsFile::No).await?;
    fleet.copy(&file, &arc1, HasFile::Yes, WantsFile::Yes).await;
    fleet.copy(&file, &arc2, HasFile::MaybeCorrupt, WantsFile::Yes).await;

    let steward = fleet.steward(test_config(None), executor(FakeCopy::new(CopyBehavior::Copy)));
    let report = steward.reclaim_space(&disk).await?;
    assert_eq!(report.deleted, 0);
    assert_eq!(report.too_few_replicas, 1);
    assert!(disk.copy_path(ACQ, "00000000_0000.h5").exists());
    assert_eq!(fleet.has_file(&file, &disk).await, Some(HasFile::Yes));

    let _ = fleet.store.set_has_file(file.id, arc2.id, HasFile::Yes).await?;
    let report = steward.reclaim_space(&disk).await?;
    assert_eq!(report.deleted, 1);
    assert!(!disk.copy_path(ACQ, "00000000_0000.h5").exists());
    assert!(!disk.acq_dir(ACQ).exists(), "empty acquisition dir is removed");

    let copy = fleet.store.copy(file.id, disk.id).await?.expect("copy row kept");
    assert_eq!(copy.has_file, HasFile::No);
    assert_eq!(copy.wants_file, WantsFile::No);
    Ok(())
}

/// A filesystem error while removing leaves the store untouched.
#[tokio::test]
async fn test_failed_remove_leaves_copy_recorded() -> Result<()> {
    let fleet = Fleet::new();
    let online = fleet.group("online").await;
    let archive = fleet.group("archive").await;
    let disk = fleet.node("disk1", online, HOST, StorageKind::Regular).await;
    let arc1 = fleet.node("arc1", archive, "host2", StorageKind::Archive).await;
    let arc2 = fleet.node("arc2", archive, "host3", StorageKind::Archive).await;

    // A non-empty directory where the file should be cannot be unlinked.
    let file = fleet.catalog_file("00000000_0000.h5", 7).await;
    let path = disk.copy_path(ACQ, "00000000_0000.h5");
    std::fs::create_dir_all(&path)?;
    std::fs::write(path.join("inner"), b"x")?;
    fleet.copy(&file, &disk, HasFile::Yes, WantsFile::No).await;
    fleet.copy(&file, &arc1, HasFile::Yes, WantsFile::Yes).await;
    fleet.copy(&file, &arc2, HasFile::Yes, WantsFile::Yes).await;

    let steward = fleet.steward(test_config(None), executor(FakeCopy::new(CopyBehavior::Copy)));
    let report = steward.reclaim_space(&disk).await?;
    assert_eq!(report.deleted, 0);
    assert_eq!(report.failed, 1);

    let copy = fleet.store.copy(file.id, disk.id).await?.expect("copy");
    assert_eq!(copy.has_file, HasFile::Yes);
    assert_eq!(copy.wants_file, WantsFile::No);
    Ok(())
}

/// Below its minimum a regular node also gives up maybe-wanted copies; an
/// archive node in the same state only gives up unwanted ones.
#[tokio::test]
async fn test_below_minimum_widens_selection() -> Result<()> {
    let fleet = Fleet::new();
    let online = fleet.group("online").await;
    let archive = fleet.group("archive").await;
    let disk = fleet.node("disk1", online, HOST, StorageKind::Regular).await;
    let local_arc = fleet.node("arc0", archive, HOST, StorageKind::Archive).await;
    let arc1 = fleet.node("arc1", archive, "host2", StorageKind::Archive).await;
    let arc2 = fleet.node("arc2", archive, "host3", StorageKind::Archive).await;

    let on_disk = fleet.file_on(&disk, "a.h5", b"aaaa").await;
    let _ = fleet.store.set_wants_file(on_disk.id, disk.id, WantsFile::MaybeRemove).await?;
    let on_arc = fleet.file_on(&local_arc, "b.h5", b"bbbb").await;
    let _ = fleet.store.set_wants_file(on_arc.id, local_arc.id, WantsFile::MaybeRemove).await?;
    for file in [&on_disk, &on_arc] {
        fleet.copy(file, &arc1, HasFile::Yes, WantsFile::Yes).await;
        fleet.copy(file, &arc2, HasFile::Yes, WantsFile::Yes).await;
    }

    let steward = fleet.steward(test_config(None), executor(FakeCopy::new(CopyBehavior::Copy)));

    // Plenty of space: maybe-wanted copies stay.
    assert_eq!(steward.reclaim_space(&disk).await?.deleted, 0);

    let starved = |n: &mut catalog::StorageNode| {
        n.min_avail_gb = 100.0;
        n.avail_gb = Some(50.0);
    };
    let disk = fleet.store.update_node(disk.id, starved).await?;
    let local_arc = fleet.store.update_node(local_arc.id, starved).await?;

    assert_eq!(steward.reclaim_space(&disk).await?.deleted, 1);
    assert_eq!(fleet.has_file(&on_disk, &disk).await, Some(HasFile::No));

    assert_eq!(steward.reclaim_space(&local_arc).await?.deleted, 0);
    assert_eq!(fleet.has_file(&on_arc, &local_arc).await, Some(HasFile::Yes));
    Ok(())
}

#[tokio::test]
async fn test_deletions_are_capped_per_call() -> Result<()> {
    let fleet = Fleet::new();
    let online = fleet.group("online").await;
    let archive = fleet.group("archive").await;
    let disk = fleet.node("disk1", online, HOST, StorageKind::Regular).await;
    let arc1 = fleet.node("arc1", archive, "host2", StorageKind::Archive).await;
    let arc2 = fleet.node("arc2", archive, "host3", StorageKind::Archive).await;

    let mut files = Vec::new();
    for name in ["a.h5", "b.h5", "c.h5"] {
        let file = fleet.file_on(&disk, name, name.as_bytes()).await;
        let _ = fleet.store.set_wants_file(file.id, disk.id, WantsFile::No).await?;
        fleet.copy(&file, &arc1, HasFile::Yes, WantsFile::Yes).await;
        fleet.copy(&file, &arc2, HasFile::Yes, WantsFile::Yes).await;
        files.push(file);
    }

    let mut config = test_config(None);
    config.reclaim_limit = 2;
    let steward = fleet.steward(config, executor(FakeCopy::new(CopyBehavior::Copy)));

    assert_eq!(steward.reclaim_space(&disk).await?.deleted, 2);
    // Lowest file ids go first.
    assert_eq!(fleet.has_file(&files[0], &disk).await, Some(HasFile::No));
    assert_eq!(fleet.has_file(&files[1], &disk).await, Some(HasFile::No));
    assert_eq!(fleet.has_file(&files[2], &disk).await, Some(HasFile::Yes));

    assert_eq!(steward.reclaim_space(&disk).await?.deleted, 1);
    assert!(disk.acq_dir(ACQ).read_dir().is_err());
    Ok(())
}
