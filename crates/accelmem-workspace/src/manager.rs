//! Per-thread registry of workspaces with scoped activation.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::rc::Rc;
use std::sync::Arc;

use accelmem_core::{
    AllocationPoint, AllocationShape, AllocationStatus, DeviceId, MemoryError, MemoryProvider,
    MemoryRuntime, MemoryTracker, Result,
};

use crate::configuration::WorkspaceConfiguration;
use crate::workspace::Workspace;

/// Owns the workspaces of one thread on one device.
///
/// The manager is `!Send`: a workspace created by one thread can never be
/// activated or mutated by another. Each worker thread creates its own.
pub struct WorkspaceManager {
    provider: Arc<dyn MemoryProvider>,
    tracker: Arc<MemoryTracker>,
    device: DeviceId,
    workspaces: HashMap<String, Workspace>,
    active: Vec<String>,
    _not_send: PhantomData<Rc<()>>,
}

impl WorkspaceManager {
    /// Bind a manager to `device` of `runtime`.
    pub fn new(runtime: &MemoryRuntime, device: DeviceId) -> Result<Self> {
        if device >= runtime.device_count() {
            return Err(MemoryError::InvalidHandle(format!("unknown device {device}")));
        }
        Ok(Self {
            provider: Arc::clone(runtime.provider()),
            tracker: Arc::clone(runtime.tracker()),
            device,
            workspaces: HashMap::new(),
            active: Vec::new(),
            _not_send: PhantomData,
        })
    }

    /// Device this manager allocates on.
    #[must_use]
    pub fn device_id(&self) -> DeviceId {
        self.device
    }

    /// Tracker the manager accounts into.
    #[must_use]
    pub fn tracker(&self) -> &Arc<MemoryTracker> {
        &self.tracker
    }

    /// Activate the workspace called `name`, creating it with `config` when
    /// it does not exist (or was destroyed). An existing workspace keeps the
    /// configuration it was created with.
    ///
    /// The workspace stays active until the returned scope is dropped.
    pub fn get_and_activate_workspace(
        &mut self,
        config: &WorkspaceConfiguration,
        name: &str,
    ) -> Result<WorkspaceScope<'_>> {
        if self.active.iter().any(|n| n == name) {
            return Err(MemoryError::InvalidHandle(format!(
                "workspace '{name}' is already active"
            )));
        }
        let reusable = self
            .workspaces
            .get(name)
            .is_some_and(|ws| !ws.is_destroyed());
        if !reusable {
            let workspace = Workspace::new(
                name,
                self.device,
                config.clone(),
                Arc::clone(&self.provider),
                Arc::clone(&self.tracker),
            )?;
            self.workspaces.insert(name.to_string(), workspace);
        }
        self.lookup_mut(name)?.enter()?;
        self.active.push(name.to_string());
        Ok(WorkspaceScope {
            manager: self,
            name: name.to_string(),
        })
    }

    /// Run `f` with the workspace `name` active, deactivating it afterwards
    /// even when `f` fails or panics.
    pub fn with_workspace<T>(
        &mut self,
        config: &WorkspaceConfiguration,
        name: &str,
        f: impl FnOnce(&mut WorkspaceManager) -> Result<T>,
    ) -> Result<T> {
        let mut scope = self.get_and_activate_workspace(config, name)?;
        f(&mut scope)
    }

    /// Workspace called `name`.
    pub fn workspace_for_current_thread(&self, name: &str) -> Result<&Workspace> {
        self.workspaces
            .get(name)
            .filter(|ws| !ws.is_destroyed())
            .ok_or_else(|| unknown(name))
    }

    /// Mutable access to the workspace called `name`.
    pub fn workspace_for_current_thread_mut(&mut self, name: &str) -> Result<&mut Workspace> {
        self.lookup_mut(name)
    }

    /// Destroy and forget the workspace called `name`. Returns `Ok(false)`
    /// when there is nothing to destroy.
    pub fn destroy_workspace(&mut self, name: &str) -> Result<bool> {
        let Some(mut workspace) = self.workspaces.remove(name) else {
            return Ok(false);
        };
        self.active.retain(|n| n != name);
        workspace.destroy_workspace()
    }

    /// Destroy every workspace of this manager.
    pub fn destroy_all_workspaces(&mut self) -> Result<()> {
        self.active.clear();
        let mut first_error = None;
        for (name, mut workspace) in self.workspaces.drain() {
            if let Err(e) = workspace.destroy_workspace() {
                tracing::error!(workspace = %name, error = %e, "failed to destroy workspace");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Whether a live workspace called `name` exists.
    #[must_use]
    pub fn check_if_workspace_exists(&self, name: &str) -> bool {
        self.workspace_for_current_thread(name).is_ok()
    }

    /// Whether a live workspace called `name` exists and is active.
    #[must_use]
    pub fn check_if_workspace_exists_and_active(&self, name: &str) -> bool {
        self.workspace_for_current_thread(name)
            .is_ok_and(Workspace::is_active)
    }

    /// Name of the innermost active workspace.
    #[must_use]
    pub fn active_workspace(&self) -> Option<&str> {
        self.active.last().map(String::as_str)
    }

    /// Allocate a device buffer: from the innermost active workspace, or from
    /// the provider when none is active.
    pub fn allocate(&mut self, shape: &AllocationShape) -> Result<AllocationPoint> {
        self.allocate_with_status(shape, AllocationStatus::Device)
    }

    /// Allocate a buffer. Inside a workspace the mirroring policy decides the
    /// placement; outside, `status` does.
    pub fn allocate_with_status(
        &mut self,
        shape: &AllocationShape,
        status: AllocationStatus,
    ) -> Result<AllocationPoint> {
        if let Some(name) = self.active.last().cloned() {
            return self.lookup_mut(&name)?.allocate(shape);
        }
        let mut point = AllocationPoint::new(self.device);
        self.provider.allocate(shape, &mut point, status)?;
        Ok(point)
    }

    /// Release a buffer. Buffers borrowed from a workspace are left alone;
    /// their memory goes back when the workspace cycles or is destroyed.
    pub fn release(&self, point: &mut AllocationPoint) -> Result<()> {
        if point.is_borrowed() {
            tracing::trace!(point = point.id(), "release of borrowed buffer ignored");
            return Ok(());
        }
        self.provider.free(point)
    }

    fn lookup_mut(&mut self, name: &str) -> Result<&mut Workspace> {
        self.workspaces
            .get_mut(name)
            .filter(|ws| !ws.is_destroyed())
            .ok_or_else(|| unknown(name))
    }

    fn deactivate(&mut self, name: &str) {
        if let Some(index) = self.active.iter().rposition(|n| n == name) {
            self.active.remove(index);
        }
        if let Some(workspace) = self.workspaces.get_mut(name) {
            workspace.exit();
        }
    }
}

fn unknown(name: &str) -> MemoryError {
    MemoryError::InvalidHandle(format!("no workspace '{name}' on this thread"))
}

impl Drop for WorkspaceManager {
    fn drop(&mut self) {
        if let Err(e) = self.destroy_all_workspaces() {
            tracing::warn!(error = %e, "failed to destroy workspaces on drop");
        }
    }
}

/// Guard keeping a workspace active. Dropping it deactivates the workspace
/// without releasing memory.
pub struct WorkspaceScope<'a> {
    manager: &'a mut WorkspaceManager,
    name: String,
}

impl WorkspaceScope<'_> {
    /// Name of the scoped workspace.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The scoped workspace.
    pub fn workspace(&self) -> Result<&Workspace> {
        self.manager.workspace_for_current_thread(&self.name)
    }
}

impl Deref for WorkspaceScope<'_> {
    type Target = WorkspaceManager;

    fn deref(&self) -> &WorkspaceManager {
        self.manager
    }
}

impl DerefMut for WorkspaceScope<'_> {
    fn deref_mut(&mut self) -> &mut WorkspaceManager {
        self.manager
    }
}

impl Drop for WorkspaceScope<'_> {
    fn drop(&mut self) {
        self.manager.deactivate(&self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use accelmem_core::{MemoryConfig, ProviderKind, SimulatedDriver};

    use crate::configuration::{MirroringPolicy, SpillPolicy};
    use crate::workspace::WorkspaceState;

    fn runtime() -> MemoryRuntime {
        MemoryRuntime::new(
            Arc::new(SimulatedDriver::new(2, 1 << 24)),
            &MemoryConfig::with_provider(ProviderKind::Direct),
        )
    }

    fn config(initial: u64) -> WorkspaceConfiguration {
        WorkspaceConfiguration::builder().initial_size(initial).build()
    }

    #[test]
    fn scope_activates_and_deactivates() {
        let runtime = runtime();
        let mut manager = WorkspaceManager::new(&runtime, 0).unwrap();
        {
            let scope = manager.get_and_activate_workspace(&config(64), "loop").unwrap();
            assert_eq!(scope.name(), "loop");
            assert_eq!(scope.active_workspace(), Some("loop"));
            assert!(scope.check_if_workspace_exists_and_active("loop"));
        }
        assert!(manager.check_if_workspace_exists("loop"));
        assert!(!manager.check_if_workspace_exists_and_active("loop"));
        assert_eq!(
            manager.workspace_for_current_thread("loop").unwrap().state(),
            WorkspaceState::Inactive
        );
        assert_eq!(manager.active_workspace(), None);
    }

    #[test]
    fn activation_is_idempotent_per_name() {
        let runtime = runtime();
        let mut manager = WorkspaceManager::new(&runtime, 0).unwrap();
        for _ in 0..3 {
            let _scope = manager.get_and_activate_workspace(&config(1024), "loop").unwrap();
        }
        assert_eq!(runtime.tracker().workspace_allocated_amount(0), 2048);
        assert_eq!(
            manager.workspace_for_current_thread("loop").unwrap().generation(),
            3
        );
    }

    #[test]
    fn nested_scopes_use_innermost() {
        let runtime = runtime();
        let mut manager = WorkspaceManager::new(&runtime, 0).unwrap();
        let mut outer = manager.get_and_activate_workspace(&config(256), "outer").unwrap();
        {
            let mut inner = outer.get_and_activate_workspace(&config(256), "inner").unwrap();
            let point = inner.allocate(&AllocationShape::new(4, 4)).unwrap();
            assert_eq!(point.owning_workspace().unwrap().name(), "inner");
        }
        let point = outer.allocate(&AllocationShape::new(4, 4)).unwrap();
        assert_eq!(point.owning_workspace().unwrap().name(), "outer");
    }

    #[test]
    fn already_active_name_is_rejected() {
        let runtime = runtime();
        let mut manager = WorkspaceManager::new(&runtime, 0).unwrap();
        let mut scope = manager.get_and_activate_workspace(&config(0), "loop").unwrap();
        assert!(matches!(
            scope.get_and_activate_workspace(&config(0), "loop"),
            Err(MemoryError::InvalidHandle(_))
        ));
    }

    #[test]
    fn with_workspace_deactivates_on_error() {
        let runtime = runtime();
        let mut manager = WorkspaceManager::new(&runtime, 0).unwrap();
        let result: Result<()> = manager.with_workspace(&config(0), "loop", |m| {
            assert!(m.check_if_workspace_exists_and_active("loop"));
            Err(MemoryError::InvalidRequest("boom".into()))
        });
        assert!(result.is_err());
        assert!(!manager.check_if_workspace_exists_and_active("loop"));
        assert_eq!(manager.active_workspace(), None);
    }

    #[test]
    fn outside_a_workspace_the_provider_serves() {
        let runtime = runtime();
        let mut manager = WorkspaceManager::new(&runtime, 1).unwrap();
        let mut point = manager.allocate(&AllocationShape::new(8, 4)).unwrap();
        assert!(!point.is_borrowed());
        assert_eq!(runtime.tracker().allocated_amount(1), 32);
        manager.release(&mut point).unwrap();
        assert_eq!(runtime.tracker().allocated_amount(1), 0);

        let mut host = manager
            .allocate_with_status(&AllocationShape::new(8, 4), AllocationStatus::Host)
            .unwrap();
        assert_eq!(runtime.tracker().host_allocated_amount(1), 32);
        manager.release(&mut host).unwrap();
    }

    #[test]
    fn releasing_borrowed_buffers_is_a_no_op() {
        let runtime = runtime();
        let mut manager = WorkspaceManager::new(&runtime, 0).unwrap();
        let mut scope = manager.get_and_activate_workspace(&config(0), "loop").unwrap();
        let mut point = scope.allocate(&AllocationShape::new(4, 4)).unwrap();
        scope.release(&mut point).unwrap();
        assert!(point.is_allocated());
        assert_eq!(runtime.tracker().workspace_allocated_amount(0), 16);
    }

    #[test]
    fn destroyed_workspace_is_unreachable_and_recreated() {
        let runtime = runtime();
        let mut manager = WorkspaceManager::new(&runtime, 0).unwrap();
        drop(manager.get_and_activate_workspace(&config(1024), "loop").unwrap());
        assert!(manager
            .workspace_for_current_thread_mut("loop")
            .unwrap()
            .destroy_workspace()
            .unwrap());
        assert!(!manager.check_if_workspace_exists("loop"));
        assert!(manager.workspace_for_current_thread("loop").is_err());
        assert_eq!(runtime.tracker().workspace_allocated_amount(0), 0);

        let scope = manager.get_and_activate_workspace(&config(1024), "loop").unwrap();
        assert_eq!(scope.workspace().unwrap().generation(), 1);
        drop(scope);
        assert_eq!(runtime.tracker().workspace_allocated_amount(0), 2048);
        assert!(manager.destroy_workspace("loop").unwrap());
        assert!(!manager.destroy_workspace("loop").unwrap());
        assert_eq!(runtime.tracker().workspace_allocated_amount(0), 0);
    }

    #[test]
    fn destroy_inside_scope() {
        let runtime = runtime();
        let mut manager = WorkspaceManager::new(&runtime, 0).unwrap();
        let mut scope = manager.get_and_activate_workspace(&config(0), "loop").unwrap();
        scope.allocate(&AllocationShape::new(4, 4)).unwrap();
        assert!(scope.destroy_workspace("loop").unwrap());
        assert_eq!(scope.active_workspace(), None);
        drop(scope);
        assert_eq!(runtime.tracker().workspace_allocated_amount(0), 0);
    }

    #[test]
    fn with_workspace_deactivates_on_panic() {
        let runtime = runtime();
        let mut manager = WorkspaceManager::new(&runtime, 0).unwrap();
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            manager.with_workspace(&config(1024), "loop", |m| -> Result<()> {
                m.allocate(&AllocationShape::bytes(64))?;
                panic!("computation failed");
            })
        }));
        assert!(outcome.is_err());
        assert_eq!(manager.active_workspace(), None);
        assert!(!manager.check_if_workspace_exists_and_active("loop"));
        assert_eq!(
            manager.workspace_for_current_thread("loop").unwrap().state(),
            WorkspaceState::Inactive
        );

        manager
            .with_workspace(&config(1024), "loop", |m| {
                assert!(m.allocate(&AllocationShape::bytes(64))?.is_borrowed());
                Ok(())
            })
            .unwrap();
        assert!(manager.destroy_workspace("loop").unwrap());
    }

    #[test]
    fn dropping_the_manager_destroys_everything() {
        let runtime = runtime();
        let mut manager = WorkspaceManager::new(&runtime, 0).unwrap();
        let host_only = WorkspaceConfiguration::builder()
            .initial_size(512)
            .policy_mirroring(MirroringPolicy::HostOnly)
            .policy_spill(SpillPolicy::Fail)
            .build();
        drop(manager.get_and_activate_workspace(&host_only, "a").unwrap());
        drop(manager.get_and_activate_workspace(&config(512), "b").unwrap());
        assert!(runtime.tracker().workspace_host_allocated_amount(0) > 0);
        drop(manager);
        assert_eq!(runtime.tracker().workspace_allocated_amount(0), 0);
        assert_eq!(runtime.tracker().workspace_host_allocated_amount(0), 0);
        assert_eq!(runtime.tracker().allocated_amount(0), 0);
    }

    #[test]
    fn unknown_device_is_rejected() {
        let runtime = runtime();
        assert!(matches!(
            WorkspaceManager::new(&runtime, 2),
            Err(MemoryError::InvalidHandle(_))
        ));
    }
}
