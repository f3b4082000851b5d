// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Catalog entities: nodes, groups, acquisitions, files, copies, requests.
//!
//! The store owns persistence; these types carry the state the engine reads
//! and the transition vocabulary it writes.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Bytes per GiB, the unit of every `*_gb` field.
pub const GIB: f64 = 1_073_741_824.0;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }
    };
}

define_id!(
    /// Storage node row id
    NodeId
);
define_id!(
    /// Storage group row id
    GroupId
);
define_id!(
    /// Acquisition row id
    AcqId
);
define_id!(
    /// Archive file row id
    FileId
);
define_id!(
    /// File copy row id
    CopyId
);
define_id!(
    /// Copy request row id
    RequestId
);

/// What a storage node is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// Long-term archive; counts toward the replica floor and is never
    /// cleaned for space.
    Archive,
    /// Removable media used to move data between sites.
    Transport,
    /// Ordinary disk.
    Regular,
    /// Tape endpoint reached only through batch jobs.
    Tape,
}

impl StorageKind {
    #[must_use]
    pub fn code(self) -> char {
        match self {
            StorageKind::Archive => 'A',
            StorageKind::Transport => 'T',
            StorageKind::Regular => 'F',
            StorageKind::Tape => 'H',
        }
    }

    #[must_use]
    pub fn from_code(code: char) -> Option<Self> {
        match code {
            'A' => Some(StorageKind::Archive),
            'T' => Some(StorageKind::Transport),
            'F' => Some(StorageKind::Regular),
            'H' => Some(StorageKind::Tape),
            _ => None,
        }
    }
}

/// Whether a node currently holds a good copy of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HasFile {
    Yes,
    No,
    /// Suspect; queued for re-verification by the integrity checker.
    MaybeCorrupt,
    /// Verified bad. Never retried automatically.
    Corrupt,
}

impl HasFile {
    #[must_use]
    pub fn code(self) -> char {
        match self {
            HasFile::Yes => 'Y',
            HasFile::No => 'N',
            HasFile::MaybeCorrupt => 'M',
            HasFile::Corrupt => 'X',
        }
    }

    #[must_use]
    pub fn from_code(code: char) -> Option<Self> {
        match code {
            'Y' => Some(HasFile::Yes),
            'N' => Some(HasFile::No),
            'M' => Some(HasFile::MaybeCorrupt),
            'X' => Some(HasFile::Corrupt),
            _ => None,
        }
    }
}

/// Whether a node should hold a copy of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WantsFile {
    Yes,
    /// Removable when the node runs short of space.
    MaybeRemove,
    No,
}

impl WantsFile {
    #[must_use]
    pub fn code(self) -> char {
        match self {
            WantsFile::Yes => 'Y',
            WantsFile::MaybeRemove => 'M',
            WantsFile::No => 'N',
        }
    }

    #[must_use]
    pub fn from_code(code: char) -> Option<Self> {
        match code {
            'Y' => Some(WantsFile::Yes),
            'M' => Some(WantsFile::MaybeRemove),
            'N' => Some(WantsFile::No),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageGroup {
    pub id: GroupId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageNode {
    pub id: NodeId,
    pub name: String,
    pub group_id: GroupId,
    /// Host the node is mounted on.
    pub host: String,
    pub root: PathBuf,
    /// Network address used for remote pulls from this node.
    pub address: Option<String>,
    /// Login used for remote pulls from this node.
    pub username: Option<String>,
    pub kind: StorageKind,
    pub active: bool,
    pub suspect: bool,
    pub min_avail_gb: f64,
    /// Cap on archived bytes; zero or negative means no cap.
    pub max_total_gb: f64,
    pub avail_gb: Option<f64>,
    pub avail_gb_last_checked: Option<DateTime<Utc>>,
}

impl StorageNode {
    #[must_use]
    pub fn is_tape(&self) -> bool {
        self.kind == StorageKind::Tape
    }

    #[must_use]
    pub fn is_archive(&self) -> bool {
        self.kind == StorageKind::Archive
    }

    #[must_use]
    pub fn is_transport(&self) -> bool {
        self.kind == StorageKind::Transport
    }

    /// Last measured free space, zero when never measured.
    #[must_use]
    pub fn avail(&self) -> f64 {
        self.avail_gb.unwrap_or(0.0)
    }

    /// True when free space is below the minimum plus `headroom_gb`.
    #[must_use]
    pub fn nearly_full(&self, headroom_gb: f64) -> bool {
        self.avail() < self.min_avail_gb + headroom_gb
    }

    /// True when measured free space is below the configured minimum.
    /// Never true for a node whose free space is unknown.
    #[must_use]
    pub fn below_minimum(&self) -> bool {
        self.avail_gb.is_some_and(|gb| gb < self.min_avail_gb)
    }

    /// Directory holding an acquisition on this node.
    #[must_use]
    pub fn acq_dir(&self, acq: &str) -> PathBuf {
        self.root.join(acq)
    }

    /// Location of a file copy on this node.
    #[must_use]
    pub fn copy_path(&self, acq: &str, file: &str) -> PathBuf {
        self.root.join(acq).join(file)
    }

    /// `user@address:path` form for pulling `path` from this node over the
    /// network. Falls back to the host name when no address is recorded.
    #[must_use]
    pub fn remote_spec(&self, path: &Path) -> String {
        let address = self.address.as_deref().unwrap_or(&self.host);
        match self.username.as_deref() {
            Some(user) => format!("{user}@{address}:{}", path.display()),
            None => format!("{address}:{}", path.display()),
        }
    }
}

/// Fields of a node being registered.
#[derive(Debug, Clone)]
pub struct NewNode {
    pub name: String,
    pub group_id: GroupId,
    pub host: String,
    pub root: PathBuf,
    pub address: Option<String>,
    pub username: Option<String>,
    pub kind: StorageKind,
    pub active: bool,
    pub suspect: bool,
    pub min_avail_gb: f64,
    pub max_total_gb: f64,
    pub avail_gb: Option<f64>,
}

impl NewNode {
    /// An active, non-suspect node with no thresholds.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        group_id: GroupId,
        host: impl Into<String>,
        root: impl Into<PathBuf>,
        kind: StorageKind,
    ) -> Self {
        Self {
            name: name.into(),
            group_id,
            host: host.into(),
            root: root.into(),
            address: None,
            username: None,
            kind,
            active: true,
            suspect: false,
            min_avail_gb: 0.0,
            max_total_gb: 0.0,
            avail_gb: None,
        }
    }

    pub(crate) fn into_node(self, id: NodeId) -> StorageNode {
        StorageNode {
            id,
            name: self.name,
            group_id: self.group_id,
            host: self.host,
            root: self.root,
            address: self.address,
            username: self.username,
            kind: self.kind,
            active: self.active,
            suspect: self.suspect,
            min_avail_gb: self.min_avail_gb,
            max_total_gb: self.max_total_gb,
            avail_gb: self.avail_gb,
            avail_gb_last_checked: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Acquisition {
    pub id: AcqId,
    pub name: String,
}

impl Acquisition {
    /// Decompose the acquisition name, see [`AcqName::parse`].
    #[must_use]
    pub fn parsed_name(&self) -> Option<AcqName> {
        AcqName::parse(&self.name)
    }
}

/// Parts encoded in an acquisition name such as
/// `20170101T120000Z_chime_corr`: start time, instrument, type tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcqName {
    pub timestamp: DateTime<Utc>,
    pub instrument: String,
    pub type_tag: String,
}

impl AcqName {
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        let (stamp, rest) = name.split_once('_')?;
        let (instrument, type_tag) = rest.rsplit_once('_')?;
        if instrument.is_empty() || type_tag.is_empty() {
            return None;
        }
        let timestamp = NaiveDateTime::parse_from_str(stamp, "%Y%m%dT%H%M%SZ")
            .ok()?
            .and_utc();
        Some(Self {
            timestamp,
            instrument: instrument.to_string(),
            type_tag: type_tag.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveFile {
    pub id: FileId,
    pub acq_id: AcqId,
    pub name: String,
    pub size_b: u64,
    /// Lowercase hex md5 of the contents.
    pub md5sum: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileCopy {
    pub id: CopyId,
    pub file_id: FileId,
    pub node_id: NodeId,
    pub has_file: HasFile,
    pub wants_file: WantsFile,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileCopyRequest {
    pub id: RequestId,
    pub file_id: FileId,
    /// Source node.
    pub node_from: NodeId,
    /// Destination group.
    pub group_to: GroupId,
    /// Priority hint, lower runs sooner.
    pub nice: i32,
    pub completed: bool,
    pub cancelled: bool,
    /// How many times the request has been re-issued.
    pub n_requests: u32,
    pub timestamp: DateTime<Utc>,
}

impl FileCopyRequest {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.completed || self.cancelled
    }
}
