// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Batch job scripts for tape transfers.
//!
//! A script is a scheduler directive header followed by one block per file
//! that stages the copy under a temporary name, checks its md5 sum, then
//! either renames it into place and touches a success marker or removes it
//! and touches a failure marker.

use super::Direction;
use super::bundle::BundleEntry;
use super::callback::{Callback, CallbackKind};
use crate::Result;
use crate::config::TapeConfig;
use catalog::StorageNode;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use tera::{Context, Tera, Value};

const PUSH_TEMPLATE: &str = r#"#!/bin/bash
#SBATCH -t {{ walltime }}
#SBATCH -p {{ partition }}
#SBATCH -J {{ job_name }}
#SBATCH -N 1

# Push {{ files | length }} files to tape
{% for f in files %}
# {{ f.shortname | replace(from="\n", to=" ") }}
hsi -q mkdir -p {{ f.dir | shell_quote }}
hsi -q put -c on -H md5 {{ f.source | shell_quote }} : {{ f.staging | shell_quote }}
HASH=$(hsi -q lshash {{ f.staging | shell_quote }} 2>&1 | awk '{print $1}')
if [ "$HASH" = {{ f.md5sum | shell_quote }} ]; then
    hsi -q mv {{ f.staging | shell_quote }} {{ f.target | shell_quote }}
    touch {{ f.success_marker | shell_quote }}
else
    hsi -q rm {{ f.staging | shell_quote }}
    touch {{ f.failed_marker | shell_quote }}
fi
{% endfor %}"#;

const PULL_TEMPLATE: &str = r#"#!/bin/bash
#SBATCH -t {{ walltime }}
#SBATCH -p {{ partition }}
#SBATCH -J {{ job_name }}
#SBATCH -N 1

# Pull {{ files | length }} files from tape
{% for f in files %}
# {{ f.shortname | replace(from="\n", to=" ") }}
mkdir -p {{ f.dir | shell_quote }}
hsi -q get {{ f.staging | shell_quote }} : {{ f.source | shell_quote }}
chmod g+r {{ f.staging | shell_quote }}
HASH=$(md5sum {{ f.staging | shell_quote }} | cut -d' ' -f1)
if [ "$HASH" = {{ f.md5sum | shell_quote }} ]; then
    mv {{ f.staging | shell_quote }} {{ f.target | shell_quote }}
    touch {{ f.success_marker | shell_quote }}
else
    rm -f {{ f.staging | shell_quote }}
    touch {{ f.failed_marker | shell_quote }}
fi
{% endfor %}"#;

/// Per-file values substituted into a template.
#[derive(Debug, Clone, Serialize)]
pub struct ScriptFile {
    pub shortname: String,
    pub source: String,
    pub dir: String,
    pub staging: String,
    pub target: String,
    pub md5sum: String,
    pub success_marker: String,
    pub failed_marker: String,
}

impl ScriptFile {
    /// Paths for moving `entry` onto `dest`, with markers written to
    /// `callback_dir`.
    #[must_use]
    pub fn new(
        direction: Direction,
        dest: &StorageNode,
        entry: &BundleEntry,
        callback_dir: &Path,
        stamp: &str,
    ) -> Self {
        let acq = entry.acq.name.as_str();
        let name = entry.file.name.as_str();
        let dir = dest.acq_dir(acq);
        let (success, failed) = match direction {
            Direction::Push => (CallbackKind::PushSuccess, CallbackKind::PushFailed),
            Direction::Pull => (CallbackKind::PullSuccess, CallbackKind::PullFailed),
        };
        let marker = |kind| {
            let callback = Callback {
                kind,
                file_id: entry.file.id,
                node_id: dest.id,
            };
            callback_dir
                .join(callback.marker_name(stamp))
                .display()
                .to_string()
        };
        Self {
            shortname: entry.shortname(),
            source: entry.source.copy_path(acq, name).display().to_string(),
            staging: dir.join(format!(".{name}.tmp")).display().to_string(),
            target: dest.copy_path(acq, name).display().to_string(),
            dir: dir.display().to_string(),
            md5sum: entry.file.md5sum.clone(),
            success_marker: marker(success),
            failed_marker: marker(failed),
        }
    }
}

/// Quote `s` as one shell word.
#[must_use]
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn shell_quote_filter(value: &Value, _: &HashMap<String, Value>) -> tera::Result<Value> {
    let s = value
        .as_str()
        .ok_or_else(|| tera::Error::msg("shell_quote expects a string"))?;
    Ok(Value::String(shell_quote(s)))
}

fn templates() -> Result<Tera> {
    let mut tera = Tera::default();
    tera.register_filter("shell_quote", shell_quote_filter);
    tera.add_raw_templates(vec![("push.sh", PUSH_TEMPLATE), ("pull.sh", PULL_TEMPLATE)])?;
    Ok(tera)
}

/// Job name, also the script file stem.
#[must_use]
pub fn job_name(direction: Direction, stamp: &str) -> String {
    format!("{}_{stamp}", direction.as_str())
}

pub fn render_script(
    direction: Direction,
    config: &TapeConfig,
    stamp: &str,
    files: &[ScriptFile],
) -> Result<String> {
    let tera = templates()?;
    let mut context = Context::new();
    context.insert("walltime", &config.walltime);
    context.insert("partition", &config.partition);
    context.insert("job_name", &job_name(direction, stamp));
    context.insert("files", files);
    let template = match direction {
        Direction::Push => "push.sh",
        Direction::Pull => "pull.sh",
    };
    Ok(tera.render(template, &context)?)
}
