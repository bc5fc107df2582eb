// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Handles created by this client and how to release them

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use tracing::debug;

use crate::constants::*;
use crate::error::{Error, Result};
use crate::types::{AuthValue, TpmsNvPublic};

/// What a tracked handle refers to, and therefore how it is released
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    /// Loaded or primary object, released with FlushContext
    Transient,
    /// Authorization session, released with FlushContext
    Session,
    /// NV index defined under `hierarchy`, released with NV_UndefineSpace
    NvIndex { hierarchy: u32 },
}

#[derive(Debug, Clone)]
pub struct TrackedHandle {
    pub handle: u32,
    pub kind: HandleKind,
    pub auth: AuthValue,
    /// TPM name, used for cpHash
    pub name: Vec<u8>,
    pub nv_public: Option<TpmsNvPublic>,
    /// Password for the hierarchy that must authorize NV_UndefineSpace
    pub release_auth: AuthValue,
}

#[derive(Debug)]
pub struct ReleaseFailure {
    pub handle: u32,
    pub kind: HandleKind,
    pub error: Error,
}

/// Outcome of a best-effort release pass
#[derive(Debug, Default)]
pub struct ReleaseReport {
    pub released: Vec<u32>,
    pub failures: Vec<ReleaseFailure>,
}

impl ReleaseReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn merge(&mut self, other: ReleaseReport) {
        self.released.extend(other.released);
        self.failures.extend(other.failures);
    }
}

impl fmt::Display for ReleaseReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} released, {} failed",
            self.released.len(),
            self.failures.len()
        )?;
        for failure in &self.failures {
            write!(f, "; 0x{:08x}: {}", failure.handle, failure.error)?;
        }
        Ok(())
    }
}

/// Per-client table of TPM-resident handles
#[derive(Debug, Default)]
pub struct HandleRegistry {
    entries: BTreeMap<u32, TrackedHandle>,
    released: HashSet<u32>,
    hierarchy_auth: HashMap<u32, AuthValue>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a handle returned by a creation response.
    ///
    /// A numeric handle released earlier and now issued again is live again.
    pub fn track(&mut self, handle: u32, kind: HandleKind, auth: AuthValue, name: Vec<u8>) {
        self.released.remove(&handle);
        debug!("tracking 0x{:08x} as {:?}", handle, kind);
        self.entries.insert(
            handle,
            TrackedHandle {
                handle,
                kind,
                auth,
                name,
                nv_public: None,
                release_auth: AuthValue::empty(),
            },
        );
    }

    /// Track an NV index defined by this client under `hierarchy`
    pub fn track_nv(
        &mut self,
        nv_public: TpmsNvPublic,
        hierarchy: u32,
        auth: AuthValue,
        name: Vec<u8>,
    ) {
        let handle = nv_public.nv_index;
        let release_auth = self.auth_for(hierarchy);
        self.track(handle, HandleKind::NvIndex { hierarchy }, auth, name);
        if let Some(entry) = self.entries.get_mut(&handle) {
            entry.nv_public = Some(nv_public);
            entry.release_auth = release_auth;
        }
    }

    pub fn get(&self, handle: u32) -> Option<&TrackedHandle> {
        self.entries.get(&handle)
    }

    pub fn contains(&self, handle: u32) -> bool {
        self.entries.contains_key(&handle)
    }

    pub fn is_released(&self, handle: u32) -> bool {
        self.released.contains(&handle)
    }

    /// Fail if `handle` was released by this client
    pub fn check(&self, handle: u32) -> Result<()> {
        if self.is_released(handle) {
            Err(Error::UseAfterRelease(handle))
        } else {
            Ok(())
        }
    }

    /// Stop tracking a handle the TPM no longer holds
    pub fn forget(&mut self, handle: u32) -> Option<TrackedHandle> {
        let entry = self.entries.remove(&handle);
        if entry.is_some() {
            self.released.insert(handle);
            debug!("released 0x{:08x}", handle);
        }
        entry
    }

    /// Forget everything without releasing it, e.g. after a power cycle
    pub fn clear(&mut self) {
        let handles: Vec<u32> = self.entries.keys().copied().collect();
        self.released.extend(handles);
        self.entries.clear();
    }

    pub fn set_hierarchy_auth(&mut self, hierarchy: u32, auth: AuthValue) {
        self.hierarchy_auth.insert(hierarchy, auth);
    }

    /// Auth value registered for `handle`; empty when none is known
    pub fn auth_for(&self, handle: u32) -> AuthValue {
        if let Some(entry) = self.entries.get(&handle) {
            return entry.auth.clone();
        }
        self.hierarchy_auth
            .get(&handle)
            .cloned()
            .unwrap_or_default()
    }

    pub fn name_of(&self, handle: u32) -> Option<&[u8]> {
        self.entries
            .get(&handle)
            .map(|e| e.name.as_slice())
            .filter(|n| !n.is_empty())
    }

    pub fn nv_public(&self, index: u32) -> Option<&TpmsNvPublic> {
        self.entries.get(&index).and_then(|e| e.nv_public.as_ref())
    }

    /// Tracked handles in ascending order
    pub fn handles(&self) -> Vec<u32> {
        self.entries.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Release every tracked handle through `release`.
    ///
    /// Sessions go first, then objects, then NV indices. A failure is
    /// recorded and the pass continues; every handle ends up untracked.
    pub fn release_all<F>(&mut self, mut release: F) -> ReleaseReport
    where
        F: FnMut(&TrackedHandle) -> Result<()>,
    {
        let mut entries: Vec<TrackedHandle> =
            std::mem::take(&mut self.entries).into_values().collect();
        entries.sort_by_key(|e| match e.kind {
            HandleKind::Session => 0,
            HandleKind::Transient => 1,
            HandleKind::NvIndex { .. } => 2,
        });

        let mut report = ReleaseReport::default();
        for entry in entries {
            self.released.insert(entry.handle);
            match release(&entry) {
                Ok(()) => report.released.push(entry.handle),
                Err(error) => report.failures.push(ReleaseFailure {
                    handle: entry.handle,
                    kind: entry.kind,
                    error,
                }),
            }
        }
        report
    }
}

/// Name of an entity whose name is its handle
pub(crate) fn handle_name(handle: u32) -> Option<Vec<u8>> {
    TpmHt::of(handle)
        .filter(|ht| ht.name_is_handle())
        .map(|_| handle.to_be_bytes().to_vec())
}
