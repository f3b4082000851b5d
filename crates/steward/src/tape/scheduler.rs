// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Batch scheduler collaborator.

use crate::command::run_command;
use crate::config::TapeConfig;
use crate::{Result, StewardError};
use async_trait::async_trait;
use std::path::Path;

#[async_trait]
pub trait BatchScheduler: Send + Sync {
    /// Jobs waiting to start in the archive partition.
    async fn pending_jobs(&self) -> Result<usize>;

    /// Submit the job script at `script`.
    async fn submit(&self, script: &Path) -> Result<()>;
}

/// Slurm, queried with `squeue` and submitted to over ssh.
#[derive(Debug, Clone)]
pub struct SlurmScheduler {
    partition: String,
    submit_host: String,
    user: String,
}

impl SlurmScheduler {
    #[must_use]
    pub fn new(partition: impl Into<String>, submit_host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            submit_host: submit_host.into(),
            user: user.into(),
        }
    }

    #[must_use]
    pub fn from_config(config: &TapeConfig) -> Self {
        let user = config
            .user
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "root".to_string());
        Self::new(&config.partition, &config.submit_host, user)
    }
}

/// Count pending jobs in `partition` from `squeue -o %all` output, a
/// `|`-separated table with a header row.
#[must_use]
pub fn count_pending(squeue: &str, partition: &str) -> usize {
    let mut lines = squeue.lines();
    let Some(header) = lines.next() else {
        return 0;
    };
    let headers: Vec<&str> = header.split('|').map(str::trim).collect();
    let Some(state_col) = headers.iter().position(|h| *h == "ST") else {
        return 0;
    };
    let Some(partition_col) = headers.iter().position(|h| *h == "PARTITION") else {
        return 0;
    };
    lines
        .filter(|line| !line.trim().is_empty())
        .filter(|line| {
            let fields: Vec<&str> = line.split('|').map(str::trim).collect();
            fields.get(state_col) == Some(&"PD") && fields.get(partition_col) == Some(&partition)
        })
        .count()
}

#[async_trait]
impl BatchScheduler for SlurmScheduler {
    async fn pending_jobs(&self) -> Result<usize> {
        let out = run_command("squeue", &["-o", "%all", "-u", &self.user]).await?;
        if !out.success() {
            return Err(StewardError::Command {
                program: "squeue".to_string(),
                message: out.stderr.trim().to_string(),
            });
        }
        Ok(count_pending(&out.stdout, &self.partition))
    }

    async fn submit(&self, script: &Path) -> Result<()> {
        let dir = script.parent().unwrap_or(Path::new("."));
        let name = script
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let remote = format!("cd {}; sbatch {name}", dir.display());
        let out = run_command("ssh", &[self.submit_host.as_str(), remote.as_str()]).await?;
        if !out.success() {
            return Err(StewardError::Command {
                program: "sbatch".to_string(),
                message: out.stderr.trim().to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_pending() {
        let out = "\
ACCOUNT|JOBID|PARTITION|ST|NAME
rpp|101|archivelong|PD|push_20170101T000000
rpp|102|archivelong|R|pull_20170101T000100
rpp|103|compute|PD|other
rpp|104|archivelong|PD|pull_20170101T000200
";
        assert_eq!(count_pending(out, "archivelong"), 2);
        assert_eq!(count_pending(out, "compute"), 1);
        assert_eq!(count_pending("", "archivelong"), 0);
        assert_eq!(count_pending("JOBID|NAME\n1|x\n", "archivelong"), 0);
    }
}
