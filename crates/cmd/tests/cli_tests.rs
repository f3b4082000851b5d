// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use anyhow::Result;
use catalog::{DuckDbStore, HasFile, NewNode, StorageKind, StorageNode, Store, WantsFile};
use cmd::commands::{
    NodeStatus, callback_command, collect_status, import_command, verify_command,
};
use steward::{ImportOutcome, Steward, StewardConfig, VerifyOptions, VerifyProblem};
use tempfile::TempDir;

const HOST: &str = "host1";
const ACQ: &str = "20170101T000000Z_chime_corr";

struct Setup {
    store: Arc<dyn Store>,
    config: StewardConfig,
    _dir: TempDir,
    disk: StorageNode,
    spare: StorageNode,
}

async fn setup() -> Result<Setup> {
    let dir = tempfile::tempdir()?;
    let store: Arc<dyn Store> = Arc::new(DuckDbStore::open_in_memory()?);
    let online = store.create_group("online").await?;
    let spare_group = store.create_group("spare").await?;

    let disk_root = dir.path().join("disk1");
    std::fs::create_dir_all(disk_root.join(ACQ))?;
    std::fs::write(disk_root.join(ACQ).join("00000000_0000.h5"), b"visibilities")?;
    let disk = store
        .create_node(NewNode::new("disk1", online.id, HOST, disk_root, StorageKind::Regular))
        .await?;

    let spare_root = dir.path().join("spare1");
    std::fs::create_dir_all(&spare_root)?;
    let spare = store
        .create_node(NewNode::new("spare1", spare_group.id, HOST, spare_root, StorageKind::Regular))
        .await?;

    let config = StewardConfig {
        host: HOST.to_string(),
        ..StewardConfig::default()
    };
    Ok(Setup {
        store,
        config,
        _dir: dir,
        disk,
        spare,
    })
}

#[tokio::test]
async fn test_import_then_status() -> Result<()> {
    let s = setup().await?;

    let outcome =
        import_command(s.store.clone(), &s.config, "disk1", ACQ, "00000000_0000.h5").await?;
    let ImportOutcome::Registered { file, suspect, .. } = outcome else {
        panic!("expected registration, got {outcome:?}");
    };
    assert!(!suspect);
    assert_eq!(file.size_b, 12);

    let again =
        import_command(s.store.clone(), &s.config, "disk1", ACQ, "00000000_0000.h5").await?;
    assert_eq!(again, ImportOutcome::AlreadyRegistered);

    let status = collect_status(s.store.as_ref(), HOST).await?;
    assert_eq!(
        status,
        vec![
            NodeStatus {
                name: "disk1".to_string(),
                kind: StorageKind::Regular,
                active: true,
                suspect: false,
                avail_gb: None,
                present: 1,
                maybe_corrupt: 0,
                unwanted: 0,
            },
            NodeStatus {
                name: "spare1".to_string(),
                kind: StorageKind::Regular,
                active: true,
                suspect: false,
                avail_gb: None,
                present: 0,
                maybe_corrupt: 0,
                unwanted: 0,
            },
        ]
    );
    assert!(collect_status(s.store.as_ref(), "elsewhere").await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_import_unknown_node_fails() -> Result<()> {
    let s = setup().await?;
    let result = import_command(s.store.clone(), &s.config, "nope", ACQ, "x.h5").await;
    assert!(result.is_err());
    Ok(())
}

#[tokio::test]
async fn test_verify_reports_missing_copy() -> Result<()> {
    let s = setup().await?;
    let _ = import_command(s.store.clone(), &s.config, "disk1", ACQ, "00000000_0000.h5").await?;
    std::fs::remove_file(s.disk.copy_path(ACQ, "00000000_0000.h5"))?;

    let steward = Steward::new(s.store.clone(), s.config.clone());
    let report = verify_command(&steward, "disk1", VerifyOptions::default()).await?;
    assert_eq!(report.checked, 1);
    assert_eq!(
        report.problems,
        vec![(format!("{ACQ}/00000000_0000.h5"), VerifyProblem::Missing)]
    );

    assert!(
        verify_command(&steward, "nope", VerifyOptions::default())
            .await
            .is_err()
    );
    Ok(())
}

#[tokio::test]
async fn test_callback_records_copy() -> Result<()> {
    let s = setup().await?;
    let outcome =
        import_command(s.store.clone(), &s.config, "disk1", ACQ, "00000000_0000.h5").await?;
    let ImportOutcome::Registered { file, .. } = outcome else {
        panic!("expected registration");
    };

    let steward = Steward::new(s.store.clone(), s.config.clone());
    assert!(
        callback_command(&steward, "push-sideways", file.id.0, s.spare.id.0)
            .await
            .is_err()
    );

    // A failure callback changes nothing.
    callback_command(&steward, "push-failed", file.id.0, s.spare.id.0).await?;
    assert!(s.store.copy(file.id, s.spare.id).await?.is_none());

    callback_command(&steward, "push-success", file.id.0, s.spare.id.0).await?;
    let copy = s.store.copy(file.id, s.spare.id).await?.expect("copy recorded");
    assert_eq!(copy.has_file, HasFile::Yes);
    assert_eq!(copy.wants_file, WantsFile::Yes);

    assert!(
        callback_command(&steward, "pull-success", file.id.0 + 100, s.spare.id.0)
            .await
            .is_err()
    );
    Ok(())
}
