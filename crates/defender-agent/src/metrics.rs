//! Metrics selection model.
//!
//! Each [`MetricsGroup`] owns a table of [`FieldSpec`]s describing the keys
//! it can emit and how they nest. A field is emitted only when its own bit is
//! set and its parent is emitted, so selection composes top-down. The public
//! flag constants carry the bits of their ancestors, which makes every named
//! flag usable on its own.

use crate::error::{DefenderError, Result};
use defender_common::types::MetricsGroup;

/// One selectable key in a group's report section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    /// Key used in the report document.
    pub name: &'static str,
    /// Index of the enclosing field in the same table, `None` at group level.
    pub parent: Option<usize>,
    /// Bit that selects this field.
    pub bit: u32,
}

/// Bitwise union of the bits of `fields[index]` and all of its ancestors.
pub const fn with_ancestors(fields: &[FieldSpec], index: usize) -> u32 {
    let mut mask = 0;
    let mut current = Some(index);
    while let Some(i) = current {
        mask |= fields[i].bit;
        current = fields[i].parent;
    }
    mask
}

/// Bitwise union of every field bit in the table.
pub const fn union_of(fields: &[FieldSpec]) -> u32 {
    let mut mask = 0;
    let mut i = 0;
    while i < fields.len() {
        mask |= fields[i].bit;
        i += 1;
    }
    mask
}

/// Field table and flag constants for [`MetricsGroup::TcpConnections`].
pub mod tcp {
    use super::{union_of, with_ancestors, FieldSpec};

    pub const ESTABLISHED_FIELD: usize = 0;
    pub const TOTAL_FIELD: usize = 1;
    pub const CONNECTIONS_FIELD: usize = 2;
    pub const REMOTE_ADDR_FIELD: usize = 3;

    pub const FIELDS: &[FieldSpec] = &[
        FieldSpec {
            name: "established_connections",
            parent: None,
            bit: 0x0000_0008,
        },
        FieldSpec {
            name: "total",
            parent: Some(ESTABLISHED_FIELD),
            bit: 0x0000_0004,
        },
        FieldSpec {
            name: "connections",
            parent: Some(ESTABLISHED_FIELD),
            bit: 0x0000_0002,
        },
        FieldSpec {
            name: "remote_addr",
            parent: Some(CONNECTIONS_FIELD),
            bit: 0x0000_0001,
        },
    ];

    /// The `established_connections` section with no inner keys.
    pub const ESTABLISHED: u32 = with_ancestors(FIELDS, ESTABLISHED_FIELD);
    /// Total count of established connections.
    pub const ESTABLISHED_TOTAL: u32 = with_ancestors(FIELDS, TOTAL_FIELD);
    /// Per-connection list, one empty entry per connection.
    pub const ESTABLISHED_CONNECTIONS: u32 = with_ancestors(FIELDS, CONNECTIONS_FIELD);
    /// Per-connection list carrying each remote address.
    pub const ESTABLISHED_REMOTE_ADDR: u32 = with_ancestors(FIELDS, REMOTE_ADDR_FIELD);
    /// Every field of the group.
    pub const ALL: u32 = union_of(FIELDS);
}

/// Field table for a group.
pub fn fields(group: MetricsGroup) -> &'static [FieldSpec] {
    match group {
        MetricsGroup::TcpConnections => tcp::FIELDS,
    }
}

/// Mask with every field of `group` selected.
pub fn all_flags(group: MetricsGroup) -> u32 {
    union_of(fields(group))
}

/// Resolves a configuration flag name (e.g. `"established_total"`) to its mask.
pub fn flag_by_name(group: MetricsGroup, name: &str) -> Option<u32> {
    match (group, name.to_lowercase().as_str()) {
        (_, "all") => Some(all_flags(group)),
        (MetricsGroup::TcpConnections, "established") => Some(tcp::ESTABLISHED),
        (MetricsGroup::TcpConnections, "established_total") => Some(tcp::ESTABLISHED_TOTAL),
        (MetricsGroup::TcpConnections, "established_connections") => {
            Some(tcp::ESTABLISHED_CONNECTIONS)
        }
        (MetricsGroup::TcpConnections, "established_remote_addr") => {
            Some(tcp::ESTABLISHED_REMOTE_ADDR)
        }
        _ => None,
    }
}

/// Whether `fields[index]` is emitted under `mask`.
pub fn is_emitted(fields: &[FieldSpec], mask: u32, index: usize) -> bool {
    let field = &fields[index];
    if mask & field.bit == 0 {
        return false;
    }
    match field.parent {
        Some(parent) => is_emitted(fields, mask, parent),
        None => true,
    }
}

/// Per-group flag table.
///
/// # Examples
///
/// ```
/// use defender_agent::metrics::{tcp, MetricsRegistry};
/// use defender_common::types::MetricsGroup;
///
/// let mut registry = MetricsRegistry::default();
/// registry.set_metrics(MetricsGroup::TcpConnections, tcp::ALL).unwrap();
/// assert_eq!(registry.metrics(MetricsGroup::TcpConnections), tcp::ALL);
///
/// assert!(registry.set_metrics(10_000u32, tcp::ALL).is_err());
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsRegistry {
    flags: [u32; MetricsGroup::COUNT],
}

impl MetricsRegistry {
    /// Overwrites the mask stored for a group.
    ///
    /// `group` may be a [`MetricsGroup`] or a raw numeric identifier; an
    /// identifier outside the known groups fails with
    /// [`DefenderError::InvalidInput`] and leaves the whole table untouched.
    pub fn set_metrics(&mut self, group: impl Into<u32>, mask: u32) -> Result<()> {
        let id = group.into();
        let group = MetricsGroup::from_id(id)
            .ok_or_else(|| DefenderError::InvalidInput(format!("unknown metrics group id {id}")))?;
        self.flags[group.index()] = mask;
        Ok(())
    }

    /// Current mask for a group.
    pub fn metrics(&self, group: MetricsGroup) -> u32 {
        self.flags[group.index()]
    }

    /// Whether field `index` of the group's table is emitted under the current mask.
    pub fn is_emitted(&self, group: MetricsGroup, index: usize) -> bool {
        is_emitted(fields(group), self.metrics(group), index)
    }

    /// Groups with a non-zero mask, in table order.
    pub fn enabled_groups(&self) -> impl Iterator<Item = MetricsGroup> + '_ {
        MetricsGroup::ALL
            .into_iter()
            .filter(move |g| self.metrics(*g) != 0)
    }
}
