// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use anyhow::Result;
use catalog::{HasFile, StorageKind, Store, WantsFile};
use steward::Steward;

use crate::common::format_gb;

/// A node as the catalog currently sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeStatus {
    pub name: String,
    pub kind: StorageKind,
    pub active: bool,
    pub suspect: bool,
    pub avail_gb: Option<f64>,
    /// Copies recorded as present.
    pub present: usize,
    /// Copies awaiting re-verification.
    pub maybe_corrupt: usize,
    /// Present copies the node no longer wants.
    pub unwanted: usize,
}

/// Summarize every node bound to `host`, in catalog order.
pub async fn collect_status(store: &dyn Store, host: &str) -> Result<Vec<NodeStatus>> {
    let mut nodes = Vec::new();
    for node in store.nodes_on_host(host).await? {
        let copies = store.copies_on_node(node.id).await?;
        let count = |pred: &dyn Fn(HasFile, WantsFile) -> bool| {
            copies
                .iter()
                .filter(|c| pred(c.has_file, c.wants_file))
                .count()
        };
        nodes.push(NodeStatus {
            present: count(&|has, _| has == HasFile::Yes),
            maybe_corrupt: count(&|has, _| has == HasFile::MaybeCorrupt),
            unwanted: count(&|has, wants| has == HasFile::Yes && wants == WantsFile::No),
            name: node.name,
            kind: node.kind,
            active: node.active,
            suspect: node.suspect,
            avail_gb: node.avail_gb,
        });
    }
    Ok(nodes)
}

#[allow(clippy::print_stdout)]
pub async fn status_command(steward: &Steward) -> Result<Vec<NodeStatus>> {
    let host = steward.config().host.as_str();
    let nodes = collect_status(steward.store(), host).await?;
    if nodes.is_empty() {
        println!("No nodes on host {host}");
    }
    for node in &nodes {
        let state = match (node.active, node.suspect) {
            (false, _) => " [inactive]",
            (true, true) => " [suspect]",
            (true, false) => "",
        };
        println!(
            "{:<16} {:<9} {:>12}  {} present, {} maybe-corrupt, {} unwanted{state}",
            node.name,
            format!("{:?}", node.kind).to_lowercase(),
            format_gb(node.avail_gb),
            node.present,
            node.maybe_corrupt,
            node.unwanted
        );
    }
    Ok(nodes)
}
