// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The context (spec §6.1): the top-level handle owning the entire
//! object graph, and the object API (construction, attribute setters,
//! name lookups, `validate`/`commit`) driven against it.

use std::net::IpAddr;

use net_types::ip::MulticastIpv4Addr;
use net_types::mac::Mac;
use net_types::port::UdpPort;
use netctl::{IfName, KernelHandle};

use crate::arena::Arena;
use crate::error::LsdnError;
use crate::iface::IfaceHandle;
use crate::ids::{NetId, PaId, PhysId, RemotePaId, RemoteVirtId, SettingsId, VirtId, VrId};
use crate::names::{NameGenerator, NameRegistry, DEFAULT_SETTINGS_NAME};
use crate::network::Network;
use crate::pa::{PhysAttachment, RemotePaView, RemoteVirtView};
use crate::phys::Phys;
use crate::problem::Problem;
use crate::rule::{Direction, MatchTarget, VirtRule};
use crate::settings::{EncapKind, Settings, UserHooks};
use crate::state::ObjectState;
use crate::virt::{Connection, Rate, Virt, MTU_UNKNOWN};

/// The top-level owner of one model graph, parameterized over the
/// [`KernelHandle`] implementation it commits against (a real
/// [`netctl::RtnetlinkKernel`] in production, a [`netctl::MockKernel`] in
/// tests, per spec §4.C).
pub struct Context<K: KernelHandle> {
    pub(crate) name: String,
    pub(crate) kernel: Option<K>,
    pub(crate) settings: Arena<Settings>,
    pub(crate) settings_names: NameRegistry,
    pub(crate) networks: Arena<Network>,
    pub(crate) network_names: NameRegistry,
    pub(crate) physes: Arena<Phys>,
    pub(crate) phys_names: NameRegistry,
    pub(crate) pas: Arena<PhysAttachment>,
    pub(crate) virts: Arena<Virt>,
    pub(crate) remote_pas: Arena<RemotePaView>,
    pub(crate) remote_virts: Arena<RemoteVirtView>,
    pub(crate) rules: Arena<VirtRule>,
    pub(crate) name_gen: NameGenerator,
    /// Set once a decommit step fails unrecoverably (spec §7): every
    /// subsequent `commit()`'s decommit phase skips its own kernel writes
    /// rather than risk acting on state of unknown shape.
    pub(crate) inconsistent: bool,
    /// The decommit-disable flag (spec §3/§5): when set, every decommit
    /// step elides its kernel request, trusting only the in-memory model
    /// is being torn down. Set by [`Context::free`] before delegating to
    /// [`Context::cleanup`], mirroring `lsdn_context_free` setting
    /// `ctx->disable_decommit` before calling `lsdn_context_cleanup`
    /// (`netmodel/lsdn.c`).
    pub(crate) decommit_disabled: bool,
    pub(crate) nomem_callback: Option<Box<dyn FnMut()>>,
}

impl<K: KernelHandle> Context<K> {
    /// Create a new, empty context named `name`, with a pre-registered
    /// `default` settings bundle (spec §3 invariant 1).
    #[must_use]
    pub fn new(name: impl Into<String>, kernel: K) -> Context<K> {
        let name = name.into();
        let mut settings = Arena::new();
        let mut settings_names = NameRegistry::new();
        let default_id = settings.insert(Settings::direct(SettingsId(0), DEFAULT_SETTINGS_NAME.to_string()));
        settings_names.insert(DEFAULT_SETTINGS_NAME, default_id);

        Context {
            name,
            kernel: Some(kernel),
            settings,
            settings_names,
            networks: Arena::new(),
            network_names: NameRegistry::new(),
            physes: Arena::new(),
            phys_names: NameRegistry::new(),
            pas: Arena::new(),
            virts: Arena::new(),
            remote_pas: Arena::new(),
            remote_virts: Arena::new(),
            rules: Arena::new(),
            name_gen: NameGenerator::new(),
            inconsistent: false,
            decommit_disabled: false,
            nomem_callback: None,
        }
    }

    /// Register a callback invoked whenever an allocation would exceed
    /// this process's modeled memory budget (spec §4.9 "abort-on-nomem").
    /// This implementation never synthesizes an allocation failure (see
    /// [`LsdnError::NoMem`]'s doc comment), so the callback is stored for
    /// API completeness but is currently never invoked; kept so a future
    /// caller wiring a real budget (e.g. via `rlimit`) has a hook ready.
    pub fn set_nomem_callback(&mut self, callback: Box<dyn FnMut()>) {
        self.nomem_callback = Some(callback);
    }

    /// Arrange for out-of-memory conditions to abort the process instead
    /// of returning [`LsdnError::NoMem`] (spec §6.1 `abort_on_nomem`).
    /// Mirrors `lsdn_context_abort_on_nomem`, which installs a callback
    /// that prints the offending problem and calls `abort()`
    /// (`netmodel/lsdn.c`).
    pub fn abort_on_nomem(&mut self) {
        self.set_nomem_callback(Box::new(|| {
            eprintln!("WARNING: out of memory, aborting");
            std::process::abort();
        }));
    }

    /// Tear down the entire in-memory model: free every phys (cascading
    /// its PAs and their virts per spec §3 invariants 3/4) and every
    /// settings bundle (cascading its networks), then run the ordinary
    /// commit engine so the kernel state backing them is actually removed
    /// (elided if [`Context::free`] set the decommit-disable flag first).
    /// Mirrors `lsdn_context_cleanup` (`netmodel/lsdn.c`), which frees
    /// every phys and settings object and then calls `lsdn_commit`.
    pub async fn cleanup(&mut self, problems: &mut Vec<Problem>) {
        let phys_ids: Vec<PhysId> = self.physes.iter().map(|(i, _)| PhysId(i)).collect();
        for id in phys_ids {
            let _ = self.phys_free(id);
        }
        let settings_ids: Vec<SettingsId> = self.settings.iter().map(|(i, _)| SettingsId(i)).collect();
        for id in settings_ids {
            let _ = self.settings_free(id);
        }
        let _ = crate::commit::commit(self, problems).await;
    }

    /// Tear down the in-memory model without touching the kernel (spec
    /// §7: "after `Inconsistent`, the only safe operation is
    /// `context_cleanup` with `disable_decommit=true`"). Also the normal
    /// way to release a context whose kernel state should survive the
    /// process (spec §6.1 `free`). Mirrors `lsdn_context_free`, which
    /// sets `ctx->disable_decommit = true` before delegating to
    /// `lsdn_context_cleanup` (`netmodel/lsdn.c`).
    pub async fn free(mut self, problems: &mut Vec<Problem>) {
        self.decommit_disabled = true;
        self.cleanup(problems).await;
    }

    /// Whether the context is inconsistent and must be rebuilt from
    /// scratch (spec §7).
    #[must_use]
    pub fn is_inconsistent(&self) -> bool {
        self.inconsistent
    }

    /// The context's kernel handle, for tests that need to inject a
    /// scripted failure or inspect the recorded request log directly
    /// (spec §4.C: "a `MockKernel`... records every request... and lets
    /// tests inject a scripted failure").
    #[must_use]
    pub fn kernel(&self) -> Option<&K> {
        self.kernel.as_ref()
    }

    fn generate_name(&mut self, kind: &str) -> String {
        let ctx_name = self.name.clone();
        self.name_gen.generate(&ctx_name, kind)
    }

    // ---- Settings -------------------------------------------------

    pub fn settings_new_direct(&mut self) -> SettingsId {
        let name = self.generate_name("settings");
        let id = self.settings.insert(Settings::direct(SettingsId(0), name.clone()));
        self.settings_names.insert(&name, id);
        self.fixup_settings_id(id)
    }

    pub fn settings_new_vlan(&mut self) -> SettingsId {
        let name = self.generate_name("settings");
        let id = self.settings.insert(Settings::vlan(SettingsId(0), name.clone()));
        self.settings_names.insert(&name, id);
        self.fixup_settings_id(id)
    }

    pub fn settings_new_vxlan_mcast(&mut self, group: MulticastIpv4Addr, port: UdpPort) -> SettingsId {
        let name = self.generate_name("settings");
        let id = self
            .settings
            .insert(Settings::vxlan_mcast(SettingsId(0), name.clone(), group, port));
        self.settings_names.insert(&name, id);
        self.fixup_settings_id(id)
    }

    pub fn settings_new_vxlan_e2e(&mut self, port: UdpPort) -> SettingsId {
        let name = self.generate_name("settings");
        let id = self.settings.insert(Settings::vxlan_e2e(SettingsId(0), name.clone(), port));
        self.settings_names.insert(&name, id);
        self.fixup_settings_id(id)
    }

    pub fn settings_new_vxlan_static(&mut self, port: UdpPort) -> SettingsId {
        let name = self.generate_name("settings");
        let id = self
            .settings
            .insert(Settings::vxlan_static(SettingsId(0), name.clone(), port));
        self.settings_names.insert(&name, id);
        self.fixup_settings_id(id)
    }

    pub fn settings_new_geneve(&mut self, port: UdpPort) -> SettingsId {
        let name = self.generate_name("settings");
        let id = self.settings.insert(Settings::geneve(SettingsId(0), name.clone(), port));
        self.settings_names.insert(&name, id);
        self.fixup_settings_id(id)
    }

    /// The arena hands back a fresh `u32` but `Settings::new` stamped its
    /// id field with a placeholder; re-stamp it with the real id the
    /// arena assigned and return it. All other `*_new` constructors
    /// follow the same two-step pattern.
    fn fixup_settings_id(&mut self, id: u32) -> SettingsId {
        let real = SettingsId(id);
        if let Some(s) = self.settings.get_mut(id) {
            s.id = real;
        }
        real
    }

    /// # Errors
    ///
    /// Returns [`LsdnError::Duplicate`] if `name` is already taken.
    pub fn settings_rename(&mut self, id: SettingsId, name: &str) -> Result<(), LsdnError> {
        let Some(s) = self.settings.get_mut(id.0) else {
            return Err(LsdnError::NoIf(format!("no such settings {id}")));
        };
        let old = s.name.clone();
        if self.settings_names.rename(&old, name, id.0) == crate::names::NameResult::Duplicate {
            return Err(LsdnError::Duplicate(format!("settings name '{name}' already in use")));
        }
        self.settings.existing_mut(id.0).name = name.to_string();
        Ok(())
    }

    #[must_use]
    pub fn settings_by_name(&self, name: &str) -> Option<SettingsId> {
        self.settings_names.get(name).map(SettingsId)
    }

    #[must_use]
    pub fn settings_get_name(&self, id: SettingsId) -> Option<&str> {
        self.settings.get(id.0).map(|s| s.name.as_str())
    }

    pub fn settings_register_hooks(&mut self, id: SettingsId, hooks: UserHooks) {
        if let Some(s) = self.settings.get_mut(id.0) {
            s.register_hooks(hooks);
        }
    }

    /// Free a settings bundle, recursively freeing every network that
    /// references it (spec §3 invariant 2: "freeing settings forces
    /// recursive freeing of its networks"). Unlike [`Context::network_free`],
    /// the cascaded networks are force-deleted even if they still carry
    /// attachments or virts — [`propagate_deletions`] then cascades the
    /// same way down to their PAs and virts at the next `commit()`.
    ///
    /// # Errors
    ///
    /// Returns [`LsdnError::NoIf`] if `id` does not exist.
    pub fn settings_free(&mut self, id: SettingsId) -> Result<(), LsdnError> {
        let s = self
            .settings
            .get_mut(id.0)
            .ok_or_else(|| LsdnError::NoIf(format!("no such settings {id}")))?;
        let was_new = s.state.mark_deleted();

        let net_ids: Vec<NetId> = self
            .networks
            .iter()
            .filter(|(_, n)| n.settings == id)
            .map(|(i, _)| NetId(i))
            .collect();
        for net_id in net_ids {
            if let Some(net) = self.networks.get_mut(net_id.0) {
                net.state = ObjectState::Delete;
            }
        }

        if was_new {
            let name = self.settings.get(id.0).map(|s| s.name.clone()).unwrap_or_default();
            self.settings_names.remove(&name);
            self.settings.remove(id.0);
        }
        Ok(())
    }

    // ---- Network ----------------------------------------------------

    /// # Errors
    ///
    /// Returns [`LsdnError::NoIf`] if `settings` does not exist.
    pub fn network_new(&mut self, settings: SettingsId, vnet_id: u32) -> Result<NetId, LsdnError> {
        if self.settings.get(settings.0).is_none() {
            return Err(LsdnError::NoIf(format!("no such settings {settings}")));
        }
        let name = self.generate_name("net");
        let id = self.networks.insert(Network::new(NetId(0), settings, vnet_id));
        self.network_names.insert(&name, id);
        let real = NetId(id);
        let net = self.networks.existing_mut(id);
        net.id = real;
        net.name = name;
        Ok(real)
    }

    #[must_use]
    pub fn network_by_name(&self, name: &str) -> Option<NetId> {
        self.network_names.get(name).map(NetId)
    }

    #[must_use]
    pub fn network_get_name(&self, id: NetId) -> Option<&str> {
        self.networks.get(id.0).map(|n| n.name.as_str())
    }

    /// # Errors
    ///
    /// Returns [`LsdnError::NoIf`] if `id` does not exist, or
    /// [`LsdnError::Duplicate`] if `name` is already taken.
    pub fn network_rename(&mut self, id: NetId, name: &str) -> Result<(), LsdnError> {
        let net = self
            .networks
            .get_mut(id.0)
            .ok_or_else(|| LsdnError::NoIf(format!("no such network {id}")))?;
        let old = net.name.clone();
        if self.network_names.rename(&old, name, id.0) == crate::names::NameResult::Duplicate {
            return Err(LsdnError::Duplicate(format!("network name '{name}' already in use")));
        }
        self.networks.existing_mut(id.0).name = name.to_string();
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`LsdnError::NoIf`] if the network does not exist, or
    /// [`LsdnError::Duplicate`] if it still has attachments or virts
    /// (spec §3: a network may not be freed while referenced).
    pub fn network_free(&mut self, id: NetId) -> Result<(), LsdnError> {
        let net = self
            .networks
            .get_mut(id.0)
            .ok_or_else(|| LsdnError::NoIf(format!("no such network {id}")))?;
        if !net.attachments.is_empty() || !net.virts.is_empty() {
            return Err(LsdnError::Duplicate(
                "network still has attachments or virts".to_string(),
            ));
        }
        if net.state.mark_deleted() {
            let name = net.name.clone();
            self.network_names.remove(&name);
            self.networks.remove(id.0);
        }
        Ok(())
    }

    // ---- Phys ---------------------------------------------------------

    pub fn phys_new(&mut self) -> PhysId {
        let name = self.generate_name("phys");
        let id = self.physes.insert(Phys::new(PhysId(0)));
        self.phys_names.insert(&name, id);
        let real = PhysId(id);
        let phys = self.physes.existing_mut(id);
        phys.id = real;
        phys.name = name;
        real
    }

    #[must_use]
    pub fn phys_by_name(&self, name: &str) -> Option<PhysId> {
        self.phys_names.get(name).map(PhysId)
    }

    #[must_use]
    pub fn phys_get_name(&self, id: PhysId) -> Option<&str> {
        self.physes.get(id.0).map(|p| p.name.as_str())
    }

    /// # Errors
    ///
    /// Returns [`LsdnError::NoIf`] if `id` does not exist, or
    /// [`LsdnError::Duplicate`] if `name` is already taken.
    pub fn phys_rename(&mut self, id: PhysId, name: &str) -> Result<(), LsdnError> {
        let phys = self
            .physes
            .get_mut(id.0)
            .ok_or_else(|| LsdnError::NoIf(format!("no such phys {id}")))?;
        let old = phys.name.clone();
        if self.phys_names.rename(&old, name, id.0) == crate::names::NameResult::Duplicate {
            return Err(LsdnError::Duplicate(format!("phys name '{name}' already in use")));
        }
        self.physes.existing_mut(id.0).name = name.to_string();
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`LsdnError::NoIf`] if `id` does not exist.
    pub fn phys_set_iface(&mut self, id: PhysId, name: &str) -> Result<(), LsdnError> {
        let phys = self
            .physes
            .get_mut(id.0)
            .ok_or_else(|| LsdnError::NoIf(format!("no such phys {id}")))?;
        let ifname = IfName::new(name).map_err(|e| LsdnError::Parse(e.to_string()))?;
        phys.iface = Some(IfaceHandle::Named(ifname));
        phys.state.mark_mutated();
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`LsdnError::NoIf`] if `id` does not exist.
    pub fn phys_set_ip(&mut self, id: PhysId, ip: IpAddr) -> Result<(), LsdnError> {
        let phys = self
            .physes
            .get_mut(id.0)
            .ok_or_else(|| LsdnError::NoIf(format!("no such phys {id}")))?;
        phys.ip = Some(ip);
        phys.state.mark_mutated();
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`LsdnError::NoIf`] if `id` does not exist.
    pub fn phys_clear_iface(&mut self, id: PhysId) -> Result<(), LsdnError> {
        let phys = self
            .physes
            .get_mut(id.0)
            .ok_or_else(|| LsdnError::NoIf(format!("no such phys {id}")))?;
        phys.iface = None;
        phys.state.mark_mutated();
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`LsdnError::NoIf`] if `id` does not exist.
    pub fn phys_clear_ip(&mut self, id: PhysId) -> Result<(), LsdnError> {
        let phys = self
            .physes
            .get_mut(id.0)
            .ok_or_else(|| LsdnError::NoIf(format!("no such phys {id}")))?;
        phys.ip = None;
        phys.state.mark_mutated();
        Ok(())
    }

    /// Mark `id` as representing this machine (spec §3 invariant 9: at
    /// most one phys may be local; enforced here rather than deferred to
    /// the validator since there is no useful partially-local state to
    /// report a `Problem` about).
    ///
    /// # Errors
    ///
    /// Returns [`LsdnError::Duplicate`] if another phys is already local.
    pub fn phys_claim_local(&mut self, id: PhysId) -> Result<(), LsdnError> {
        if self.physes.iter().any(|(i, p)| i != id.0 && p.is_local) {
            return Err(LsdnError::Duplicate("another phys is already local".to_string()));
        }
        let phys = self
            .physes
            .get_mut(id.0)
            .ok_or_else(|| LsdnError::NoIf(format!("no such phys {id}")))?;
        phys.is_local = true;
        Ok(())
    }

    /// Clear `id`'s local-phys marking. Does not by itself tear down any
    /// already-committed kernel state — `committed_as_local` stays until
    /// the next commit's decommit phase observes `is_local` having gone
    /// false and retires the PAs that were local (spec §3: `is_local` is
    /// model-only, `committed_as_local` reflects the last commit).
    ///
    /// # Errors
    ///
    /// Returns [`LsdnError::NoIf`] if `id` does not exist.
    pub fn phys_unclaim_local(&mut self, id: PhysId) -> Result<(), LsdnError> {
        let phys = self
            .physes
            .get_mut(id.0)
            .ok_or_else(|| LsdnError::NoIf(format!("no such phys {id}")))?;
        phys.is_local = false;
        phys.state.mark_mutated();
        let pa_ids = phys.attachments.clone();
        for pa_id in pa_ids {
            if let Some(pa) = self.pas.get_mut(pa_id.0) {
                pa.state.mark_mutated();
            }
        }
        Ok(())
    }

    /// Attach `phys` to `net`, creating the (phys, net) [`PhysAttachment`]
    /// if one does not already exist (spec §6.1 `attach`).
    ///
    /// # Errors
    ///
    /// Returns [`LsdnError::NoIf`] if either id is unknown.
    pub fn phys_attach(&mut self, phys_id: PhysId, net_id: NetId) -> Result<PaId, LsdnError> {
        if self.physes.get(phys_id.0).is_none() {
            return Err(LsdnError::NoIf(format!("no such phys {phys_id}")));
        }
        if self.networks.get(net_id.0).is_none() {
            return Err(LsdnError::NoIf(format!("no such network {net_id}")));
        }
        let existing = self
            .pas
            .iter()
            .find(|(_, pa)| pa.phys == phys_id && pa.network == net_id)
            .map(|(i, _)| PaId(i));
        let pa_id = match existing {
            Some(id) => id,
            None => {
                let raw = self.pas.insert(PhysAttachment::new(PaId(0), phys_id, net_id));
                let real = PaId(raw);
                self.pas.existing_mut(raw).id = real;
                self.networks.existing_mut(net_id.0).attachments.push(real);
                self.physes.existing_mut(phys_id.0).attachments.push(real);
                real
            }
        };
        let pa = self.pas.existing_mut(pa_id.0);
        pa.explicitly_attached = true;
        pa.state.mark_mutated();
        Ok(pa_id)
    }

    /// Detach `phys` from `net`: clears `explicitly_attached`; the PA is
    /// only actually torn down once no connected virt keeps it alive
    /// (spec §3 invariant 3), which the commit engine's state-propagation
    /// step (§4.8 step 1) evaluates.
    ///
    /// # Errors
    ///
    /// Returns [`LsdnError::NoIf`] if no such attachment exists.
    pub fn phys_detach(&mut self, phys_id: PhysId, net_id: NetId) -> Result<(), LsdnError> {
        let pa = self
            .pas
            .iter_mut()
            .find(|(_, pa)| pa.phys == phys_id && pa.network == net_id)
            .map(|(_, pa)| pa)
            .ok_or_else(|| LsdnError::NoIf("no such attachment".to_string()))?;
        pa.explicitly_attached = false;
        if !pa.should_exist() {
            pa.state.mark_deleted();
        }
        Ok(())
    }

    /// Free a phys. Every PA it still participates in is force-deleted
    /// regardless of whether it has connected virts or is still
    /// explicitly attached — [`propagate_deletions`] cascades the same
    /// way down to those PAs' virts at the next `commit()`.
    ///
    /// # Errors
    ///
    /// Returns [`LsdnError::NoIf`] if `id` does not exist.
    pub fn phys_free(&mut self, id: PhysId) -> Result<(), LsdnError> {
        let phys = self
            .physes
            .get_mut(id.0)
            .ok_or_else(|| LsdnError::NoIf(format!("no such phys {id}")))?;
        if phys.attachments.is_empty() {
            let was_new = phys.state.mark_deleted();
            if was_new {
                let name = phys.name.clone();
                self.phys_names.remove(&name);
                self.physes.remove(id.0);
                return Ok(());
            }
        } else {
            // Has attachments: always force to `Delete` (even if `New`) so
            // `propagate_deletions` sees this phys in its `deleted_physes`
            // set at the next `commit()` and cascades to each PA, freeing
            // uncommitted ones immediately and queuing the rest for
            // Phase D — mirrors `settings_free`'s forced-cascade contract.
            phys.state = ObjectState::Delete;
        }
        Ok(())
    }

    // ---- Virt -----------------------------------------------------

    /// # Errors
    ///
    /// Returns [`LsdnError::NoIf`] if `net` does not exist.
    pub fn virt_new(&mut self, net_id: NetId) -> Result<VirtId, LsdnError> {
        if self.networks.get(net_id.0).is_none() {
            return Err(LsdnError::NoIf(format!("no such network {net_id}")));
        }
        let name = self.generate_name("virt");
        let raw = self.virts.insert(Virt::new(VirtId(0), net_id));
        let real = VirtId(raw);
        let virt = self.virts.existing_mut(raw);
        virt.id = real;
        virt.name = name.clone();
        self.networks.existing_mut(net_id.0).virts.push(real);
        self.networks.existing_mut(net_id.0).virt_names.insert(&name, raw);
        Ok(real)
    }

    #[must_use]
    pub fn virt_get_name(&self, id: VirtId) -> Option<&str> {
        self.virts.get(id.0).map(|v| v.name.as_str())
    }

    /// Look up a virt by name within `net_id`'s own registry (spec §3
    /// invariant 1: virt names are unique per-network, not per-context).
    #[must_use]
    pub fn virt_by_name(&self, net_id: NetId, name: &str) -> Option<VirtId> {
        self.networks.get(net_id.0)?.virt_names.get(name).map(VirtId)
    }

    /// # Errors
    ///
    /// Returns [`LsdnError::NoIf`] if `id` does not exist, or
    /// [`LsdnError::Duplicate`] if `name` is already taken within the
    /// virt's network.
    pub fn virt_rename(&mut self, id: VirtId, name: &str) -> Result<(), LsdnError> {
        let net_id = self
            .virts
            .get(id.0)
            .ok_or_else(|| LsdnError::NoIf(format!("no such virt {id}")))?
            .network;
        let old = self.virts.existing(id.0).name.clone();
        let net = self.networks.existing_mut(net_id.0);
        if net.virt_names.rename(&old, name, id.0) == crate::names::NameResult::Duplicate {
            return Err(LsdnError::Duplicate(format!("virt name '{name}' already in use in this network")));
        }
        self.virts.existing_mut(id.0).name = name.to_string();
        Ok(())
    }

    /// Connect a virt to `phys` via `iface_name`, creating the (phys,
    /// net) attachment implicitly if it does not exist yet (spec §3
    /// invariant 3).
    ///
    /// # Errors
    ///
    /// Returns [`LsdnError::NoIf`] if the virt or phys is unknown.
    pub fn virt_connect(&mut self, virt_id: VirtId, phys_id: PhysId, iface_name: &str) -> Result<(), LsdnError> {
        let net_id = self
            .virts
            .get(virt_id.0)
            .ok_or_else(|| LsdnError::NoIf(format!("no such virt {virt_id}")))?
            .network;
        let pa_id = self.phys_attach_implicit(phys_id, net_id)?;
        let ifname = IfName::new(iface_name).map_err(|e| LsdnError::Parse(e.to_string()))?;
        let virt = self.virts.existing_mut(virt_id.0);
        virt.connected = Some(Connection { phys: phys_id, pa: pa_id });
        virt.iface = IfaceHandle::Named(ifname);
        virt.state.mark_mutated();
        self.pas.existing_mut(pa_id.0).connected_virts.push(virt_id);
        Ok(())
    }

    fn phys_attach_implicit(&mut self, phys_id: PhysId, net_id: NetId) -> Result<PaId, LsdnError> {
        if self.physes.get(phys_id.0).is_none() {
            return Err(LsdnError::NoIf(format!("no such phys {phys_id}")));
        }
        let existing = self
            .pas
            .iter()
            .find(|(_, pa)| pa.phys == phys_id && pa.network == net_id)
            .map(|(i, _)| PaId(i));
        Ok(match existing {
            Some(id) => id,
            None => {
                let raw = self.pas.insert(PhysAttachment::new(PaId(0), phys_id, net_id));
                let real = PaId(raw);
                self.pas.existing_mut(raw).id = real;
                self.networks.existing_mut(net_id.0).attachments.push(real);
                self.physes.existing_mut(phys_id.0).attachments.push(real);
                real
            }
        })
    }

    /// Disconnect a virt (spec §6.1 `disconnect`): clears `connected`
    /// without touching `committed_to`, so the commit engine can still
    /// see where it needs to be decommitted from.
    ///
    /// # Errors
    ///
    /// Returns [`LsdnError::NoIf`] if the virt is unknown.
    pub fn virt_disconnect(&mut self, virt_id: VirtId) -> Result<(), LsdnError> {
        let virt = self
            .virts
            .get_mut(virt_id.0)
            .ok_or_else(|| LsdnError::NoIf(format!("no such virt {virt_id}")))?;
        if let Some(conn) = virt.connected.take() {
            if let Some(pa) = self.pas.get_mut(conn.pa.0) {
                pa.connected_virts.retain(|v| *v != virt_id);
                if !pa.should_exist() {
                    pa.state.mark_deleted();
                }
            }
        }
        virt.state.mark_mutated();
        Ok(())
    }

    /// Free a virt (spec §6.1 `free`): disconnects it first (if connected,
    /// so its owning PA can re-evaluate `should_exist`), frees every virt
    /// rule attached to it, then either removes it immediately (never
    /// committed) or marks it `Delete` for Phase D to tear down its
    /// committed kernel state.
    ///
    /// # Errors
    ///
    /// Returns [`LsdnError::NoIf`] if the virt is unknown.
    pub fn virt_free(&mut self, virt_id: VirtId) -> Result<(), LsdnError> {
        if self.virts.get(virt_id.0).is_none() {
            return Err(LsdnError::NoIf(format!("no such virt {virt_id}")));
        }
        self.virt_disconnect(virt_id)?;
        self.vrs_free_all(virt_id);

        let virt = self.virts.existing_mut(virt_id.0);
        let was_new = virt.state.mark_deleted();
        if was_new {
            let net_id = virt.network;
            let name = virt.name.clone();
            self.virts.remove(virt_id.0);
            if let Some(net) = self.networks.get_mut(net_id.0) {
                net.virts.retain(|v| *v != virt_id);
                net.virt_names.remove(&name);
            }
        }
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`LsdnError::NoIf`] if the virt is unknown.
    pub fn virt_set_mac(&mut self, virt_id: VirtId, mac: Mac) -> Result<(), LsdnError> {
        let virt = self
            .virts
            .get_mut(virt_id.0)
            .ok_or_else(|| LsdnError::NoIf(format!("no such virt {virt_id}")))?;
        virt.mac = Some(mac);
        virt.state.mark_mutated();
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`LsdnError::NoIf`] if the virt is unknown.
    pub fn virt_clear_mac(&mut self, virt_id: VirtId) -> Result<(), LsdnError> {
        let virt = self
            .virts
            .get_mut(virt_id.0)
            .ok_or_else(|| LsdnError::NoIf(format!("no such virt {virt_id}")))?;
        virt.mac = None;
        virt.state.mark_mutated();
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`LsdnError::NoIf`] if the virt is unknown.
    pub fn virt_set_rate_in(&mut self, virt_id: VirtId, rate: Option<Rate>) -> Result<(), LsdnError> {
        let virt = self
            .virts
            .get_mut(virt_id.0)
            .ok_or_else(|| LsdnError::NoIf(format!("no such virt {virt_id}")))?;
        virt.rate_in = rate;
        virt.state.mark_mutated();
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`LsdnError::NoIf`] if the virt is unknown.
    pub fn virt_set_rate_out(&mut self, virt_id: VirtId, rate: Option<Rate>) -> Result<(), LsdnError> {
        let virt = self
            .virts
            .get_mut(virt_id.0)
            .ok_or_else(|| LsdnError::NoIf(format!("no such virt {virt_id}")))?;
        virt.rate_out = rate;
        virt.state.mark_mutated();
        Ok(())
    }

    /// `virt_get_recommended_mtu` (spec §5 supplement item 4): the
    /// connected phys's link MTU minus the network's encapsulation
    /// overhead, or [`MTU_UNKNOWN`] if the virt is not connected or its
    /// phys's interface has not been resolved.
    #[must_use]
    pub fn virt_get_recommended_mtu(&self, virt_id: VirtId, phys_mtu: Option<u32>) -> u32 {
        let Some(virt) = self.virts.get(virt_id.0) else {
            return MTU_UNKNOWN;
        };
        let Some(net) = self.networks.get(virt.network.0) else {
            return MTU_UNKNOWN;
        };
        let Some(settings) = self.settings.get(net.settings.0) else {
            return MTU_UNKNOWN;
        };
        let Some(phys_mtu) = phys_mtu else {
            return MTU_UNKNOWN;
        };
        let underlay = virt
            .connected
            .as_ref()
            .and_then(|c| self.physes.get(c.phys.0))
            .and_then(|p| p.ip);
        phys_mtu.saturating_sub(crate::vtable::tunneling_overhead(settings.encap, underlay))
    }

    // ---- Virt rules ----------------------------------------------------

    /// # Errors
    ///
    /// Returns [`LsdnError::NoIf`] if the virt is unknown, or propagates
    /// [`VirtRule::new`]'s priority-range error.
    pub fn vr_new(&mut self, virt_id: VirtId, priority: u16, direction: Direction) -> Result<VrId, LsdnError> {
        if self.virts.get(virt_id.0).is_none() {
            return Err(LsdnError::NoIf(format!("no such virt {virt_id}")));
        }
        let rule = VirtRule::new(virt_id, priority, direction)?;
        let raw = self.rules.insert(rule);
        let id = VrId(raw);
        self.virts.existing_mut(virt_id.0).rules.push(id);
        self.virts.existing_mut(virt_id.0).state.mark_mutated();
        Ok(id)
    }

    /// # Errors
    ///
    /// Returns [`LsdnError::NoIf`] if the rule is unknown, or propagates
    /// [`VirtRule::add_target`]'s too-many-targets error.
    pub fn vr_add_target(&mut self, vr_id: VrId, target: MatchTarget) -> Result<(), LsdnError> {
        let rule = self
            .rules
            .get_mut(vr_id.0)
            .ok_or_else(|| LsdnError::NoIf(format!("no such rule {vr_id}")))?;
        rule.add_target(target)
    }

    /// # Errors
    ///
    /// Returns [`LsdnError::NoIf`] if the rule is unknown.
    pub fn vr_free(&mut self, vr_id: VrId) -> Result<(), LsdnError> {
        let rule = self
            .rules
            .get(vr_id.0)
            .ok_or_else(|| LsdnError::NoIf(format!("no such rule {vr_id}")))?;
        let virt_id = rule.virt;
        self.rules.remove(vr_id.0);
        if let Some(virt) = self.virts.get_mut(virt_id.0) {
            virt.rules.retain(|r| *r != vr_id);
            virt.state.mark_mutated();
        }
        Ok(())
    }

    /// Free every rule attached to `virt_id` (spec §6.1 `vrs_free_all`).
    pub fn vrs_free_all(&mut self, virt_id: VirtId) {
        let Some(virt) = self.virts.get_mut(virt_id.0) else {
            return;
        };
        let ids = std::mem::take(&mut virt.rules);
        for id in ids {
            self.rules.remove(id.0);
        }
    }

    /// Attempt to resolve the connected interface of every live virt whose
    /// PA is both explicitly attached and local, mirroring
    /// `validate_virts_pa`'s own `lsdn_if_resolve` call: the original
    /// validator performs this resolution itself rather than reading a
    /// cache, so a virt whose interface only came into existence between
    /// `connect()` and `commit()` still passes. A failed resolution is not
    /// an error here — it just leaves `iface` unresolved, which
    /// [`crate::validator::check_virt`] then reports as `VIRT_NOIF`.
    pub async fn resolve_local_virt_ifaces(&mut self) {
        let Some(kernel) = self.kernel.as_ref() else { return };
        let eligible: Vec<VirtId> = self
            .virts
            .iter()
            .filter(|(_, v)| v.state != ObjectState::Delete)
            .filter_map(|(id, v)| {
                let conn = v.connected.as_ref()?;
                let pa = self.pas.get(conn.pa.0)?;
                let phys = self.physes.get(pa.phys.0)?;
                (pa.explicitly_attached && phys.is_local).then_some(VirtId(id))
            })
            .collect();
        for virt_id in eligible {
            if let Some(virt) = self.virts.get_mut(virt_id.0) {
                let _ = virt.iface.resolve(kernel).await;
            }
        }
    }

    /// Buffer every [`Problem`] the validator (C9) finds against the
    /// current graph; returns `true` iff none were found.
    pub fn validate(&self, problems: &mut Vec<Problem>) -> bool {
        let settings: Vec<&Settings> = self.settings.iter().map(|(_, s)| s).collect();
        let networks: Vec<&Network> = self.networks.iter().map(|(_, n)| n).collect();
        let physes: Vec<&Phys> = self.physes.iter().map(|(_, p)| p).collect();
        let pas: Vec<&PhysAttachment> = self.pas.iter().map(|(_, p)| p).collect();
        let virts: Vec<&Virt> = self.virts.iter().map(|(_, v)| v).collect();
        let rules: Vec<&VirtRule> = self.rules.iter().map(|(_, r)| r).collect();
        let input = crate::validator::ValidatorInput {
            settings: &settings,
            networks: &networks,
            physes: &physes,
            pas: &pas,
            virts: &virts,
            rules: &rules,
        };
        crate::validator::validate(&input, problems)
    }

    /// The current [`ObjectState`] of a virt, or `None` if it no longer
    /// exists (freed, or decommitted away).
    #[must_use]
    pub fn virt_state(&self, id: VirtId) -> Option<ObjectState> {
        self.virts.get(id.0).map(|v| v.state)
    }

    /// The current [`ObjectState`] of a PA, or `None` if it no longer
    /// exists.
    #[must_use]
    pub fn pa_state(&self, id: PaId) -> Option<ObjectState> {
        self.pas.get(id.0).map(|p| p.state)
    }

    /// The PA id for the `(phys, network)` pair, if one exists.
    #[must_use]
    pub fn pa_find(&self, phys_id: PhysId, net_id: NetId) -> Option<PaId> {
        self.pas.iter().find(|(_, p)| p.phys == phys_id && p.network == net_id).map(|(i, _)| PaId(i))
    }

    /// How many remote-PA views a PA currently carries (spec §8's "for
    /// every pair of committed PAs... remote-PA views exist in both
    /// directions" invariant, exposed for tests).
    #[must_use]
    pub fn remote_pa_count(&self, id: PaId) -> usize {
        self.pas.get(id.0).map(|p| p.remote_pas.len()).unwrap_or(0)
    }

    #[must_use]
    pub fn remote_pas_of(&self, pa: PaId) -> Vec<RemotePaId> {
        self.pas.get(pa.0).map(|p| p.remote_pas.clone()).unwrap_or_default()
    }

    #[must_use]
    pub fn remote_virts_of(&self, remote_pa: RemotePaId) -> Vec<RemoteVirtId> {
        self.remote_pas
            .get(remote_pa.0)
            .map(|v| v.remote_virts.clone())
            .unwrap_or_default()
    }

    /// Walk the arena and print a human-readable tree of the in-memory
    /// model (settings → networks, phys → PA → virt), purely diagnostic
    /// and gated behind the `"netops"` trace tag like the rest of the
    /// vtable-call tracing (`SPEC_FULL.md` §5 item 2, grounded on the
    /// original `lsdn_dump_context`). Never touches the kernel and never
    /// appears in a committed state.
    pub fn dump(&self) {
        if !tracing::enabled!(target: "netops", tracing::Level::DEBUG) {
            return;
        }
        tracing::debug!(target: "netops", "context {}", self.name);
        for (_, s) in self.settings.iter() {
            tracing::debug!(target: "netops", "  settings {} ({:?}, {:?}) [{:?}]", s.name, s.encap, s.switching, s.state);
        }
        for (_, n) in self.networks.iter() {
            tracing::debug!(target: "netops", "  network {} vnet_id={} [{:?}]", n.name, n.vnet_id, n.state);
            for virt_id in &n.virts {
                if let Some(v) = self.virts.get(virt_id.0) {
                    tracing::debug!(target: "netops", "    virt {} mac={:?} [{:?}]", v.name, v.mac, v.state);
                }
            }
        }
        for (_, p) in self.physes.iter() {
            tracing::debug!(
                target: "netops",
                "  phys {} local={} committed_as_local={} [{:?}]",
                p.name, p.is_local, p.committed_as_local, p.state
            );
            for pa_id in &p.attachments {
                if let Some(pa) = self.pas.get(pa_id.0) {
                    tracing::debug!(
                        target: "netops",
                        "    pa net={:?} explicit={} connected_virts={} [{:?}]",
                        pa.network, pa.explicitly_attached, pa.connected_virts.len(), pa.state
                    );
                }
            }
        }
    }
}

/// Which encapsulation kind a settings uses, looked up through a network
/// id; a small helper the commit engine (C10) leans on repeatedly.
pub(crate) fn encap_of<K: KernelHandle>(ctx: &Context<K>, net_id: NetId) -> Option<EncapKind> {
    let net = ctx.networks.get(net_id.0)?;
    let settings = ctx.settings.get(net.settings.0)?;
    Some(settings.encap)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // valid in test code
mod test {
    use super::*;
    use netctl::MockKernel;

    fn ctx() -> Context<MockKernel> {
        Context::new("test", MockKernel::new())
    }

    #[test]
    fn new_context_registers_default_settings() {
        let c = ctx();
        assert_eq!(c.settings_by_name(DEFAULT_SETTINGS_NAME), Some(SettingsId(0)));
    }

    #[test]
    fn phys_attach_is_idempotent_per_phys_net_pair() {
        let mut c = ctx();
        let net = c.network_new(SettingsId(0), 1).unwrap();
        let phys = c.phys_new();
        let a = c.phys_attach(phys, net).unwrap();
        let b = c.phys_attach(phys, net).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn detaching_with_no_connected_virts_marks_delete() {
        let mut c = ctx();
        let net = c.network_new(SettingsId(0), 1).unwrap();
        let phys = c.phys_new();
        let pa = c.phys_attach(phys, net).unwrap();
        c.phys_detach(phys, net).unwrap();
        assert_eq!(c.pas.get(pa.0).unwrap().state, ObjectState::Delete);
    }

    #[test]
    fn connecting_virt_creates_implicit_attachment() {
        let mut c = ctx();
        let net = c.network_new(SettingsId(0), 1).unwrap();
        let phys = c.phys_new();
        let virt = c.virt_new(net).unwrap();
        c.virt_connect(virt, phys, "veth0").unwrap();
        assert_eq!(c.pas.iter().count(), 1);
        assert!(!c.pas.iter().next().unwrap().1.explicitly_attached);
    }

    #[test]
    fn get_recommended_mtu_is_unknown_when_disconnected() {
        let mut c = ctx();
        let net = c.network_new(SettingsId(0), 1).unwrap();
        let virt = c.virt_new(net).unwrap();
        assert_eq!(c.virt_get_recommended_mtu(virt, None), MTU_UNKNOWN);
    }

    #[test]
    fn get_recommended_mtu_accounts_for_ipv6_underlay() {
        let mut c = ctx();
        let settings = c.settings_new_geneve(net_types::port::UdpPort::GENEVE_DEFAULT);
        let net = c.network_new(settings, 1).unwrap();
        let phys = c.phys_new();
        c.phys_set_ip(phys, IpAddr::from([0, 0, 0, 0, 0, 0, 0, 1])).unwrap();
        let virt = c.virt_new(net).unwrap();
        c.virt_connect(virt, phys, "veth0").unwrap();
        assert_eq!(c.virt_get_recommended_mtu(virt, Some(1500)), 1430);
    }

    #[test]
    fn dump_does_not_panic_on_a_populated_graph() {
        let mut c = ctx();
        let net = c.network_new(SettingsId(0), 1).unwrap();
        let phys = c.phys_new();
        c.phys_attach(phys, net).unwrap();
        let virt = c.virt_new(net).unwrap();
        c.virt_connect(virt, phys, "veth0").unwrap();
        c.dump();
    }

    #[tokio::test]
    async fn cleanup_frees_every_phys_and_settings() {
        let mut c = ctx();
        let net = c.network_new(SettingsId(0), 1).unwrap();
        let phys = c.phys_new();
        c.phys_attach(phys, net).unwrap();
        c.virt_new(net).unwrap();

        let mut problems = Vec::new();
        c.cleanup(&mut problems).await;

        assert!(c.physes.iter().next().is_none());
        assert!(c.networks.iter().next().is_none());
    }

    #[tokio::test]
    async fn decommit_disabled_elides_kernel_teardown_requests() {
        use netctl::kernel::KernelRequest;

        let mut c = ctx();
        let settings = c.settings_new_vlan();
        let net = c.network_new(settings, 1).unwrap();
        let phys = c.phys_new();
        c.kernel().unwrap().register_existing_link("out");
        c.phys_set_iface(phys, "out").unwrap();
        c.phys_claim_local(phys).unwrap();
        c.phys_attach(phys, net).unwrap();
        let virt = c.virt_new(net).unwrap();
        c.kernel().unwrap().register_existing_link("veth0");
        c.virt_connect(virt, phys, "veth0").unwrap();

        let mut problems = Vec::new();
        crate::commit::commit(&mut c, &mut problems).await;

        assert!(!c.decommit_disabled);
        c.decommit_disabled = true;
        c.phys_free(phys).unwrap();
        crate::commit::commit(&mut c, &mut problems).await;

        assert!(!c.kernel().unwrap().log().iter().any(|r| matches!(
            r,
            KernelRequest::DeleteLink { .. } | KernelRequest::DeleteFlower { .. }
        )));
    }

    #[tokio::test]
    async fn free_tears_down_the_in_memory_model() {
        let mut c = ctx();
        let net = c.network_new(SettingsId(0), 1).unwrap();
        c.phys_new();
        c.virt_new(net).unwrap();

        c.free(&mut Vec::new()).await;
        // `free` consumes `c`; the point of the call is that it completes
        // without touching the kernel, which `decommit_disabled_elides_*`
        // above verifies directly.
    }

    #[test]
    fn abort_on_nomem_replaces_any_previously_registered_callback() {
        let mut c = ctx();
        c.set_nomem_callback(Box::new(|| {}));
        c.abort_on_nomem();
        assert!(c.nomem_callback.is_some());
    }
}
