//! Ownership of all live kernels and their parent/child relations.

use super::{Kernel, KernelId, ParentInfo, ParentThread};
use crate::{config, resources, streams::StreamManager};
use indexmap::IndexMap;

/// All live kernels, in launch order.
#[derive(Debug, Default)]
pub struct KernelRegistry {
    kernels: IndexMap<KernelId, Kernel>,
}

impl KernelRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, kernel: Kernel) -> KernelId {
        let id = kernel.id;
        let existing = self.kernels.insert(id, kernel);
        assert!(existing.is_none(), "{id} registered twice");
        id
    }

    #[must_use]
    pub fn get(&self, id: KernelId) -> Option<&Kernel> {
        self.kernels.get(&id)
    }

    #[must_use]
    pub fn get_mut(&mut self, id: KernelId) -> Option<&mut Kernel> {
        self.kernels.get_mut(&id)
    }

    fn kernel(&self, id: KernelId) -> &Kernel {
        self.kernels
            .get(&id)
            .unwrap_or_else(|| panic!("unknown {id}"))
    }

    fn kernel_mut(&mut self, id: KernelId) -> &mut Kernel {
        self.kernels
            .get_mut(&id)
            .unwrap_or_else(|| panic!("unknown {id}"))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Kernel> + '_ {
        self.kernels.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }

    /// Makes `parent.kernel` the parent of `child`.
    pub fn set_parent(&mut self, child: KernelId, parent: ParentInfo) {
        self.kernel_mut(child).parent = Some(parent);
        self.kernel_mut(parent.kernel).children.push(child);
        log::debug!("{} launched by {}", child, parent);
    }

    /// Adds another launching thread to `child`.
    ///
    /// The first launching thread becomes the parent of the kernel.
    pub fn add_parent(&mut self, child: KernelId, parent: ParentInfo) {
        if self.kernel(child).parent.is_none() {
            self.set_parent(child, parent);
        }
        self.kernel_mut(child)
            .parent_threads
            .push(parent.parent_thread());
    }

    pub fn remove_child(&mut self, parent: KernelId, child: KernelId) {
        let children = &mut self.kernel_mut(parent).children;
        let Some(pos) = children.iter().position(|c| *c == child) else {
            panic!("{child} is not a child of {parent}");
        };
        children.remove(pos);
    }

    #[must_use]
    pub fn children_all_finished(&self, id: KernelId) -> bool {
        self.kernel(id).children.is_empty()
    }

    /// Done with all blocks and without live children.
    #[must_use]
    pub fn is_finished(&self, id: KernelId) -> bool {
        self.kernel(id).done() && self.children_all_finished(id)
    }

    /// Propagates the completion of `child` to its parent kernel.
    pub fn notify_parent_finished(
        &mut self,
        child: KernelId,
        config: &config::GPU,
        resources: &mut resources::ResourceAccounting,
        streams: &mut StreamManager,
    ) {
        let child_kernel = self.kernel(child);
        let Some(parent) = child_kernel.parent else {
            return;
        };

        let mut footprint =
            resources.child_param_footprint(config, child_kernel.entry.args_aligned_size);
        let waiting: Vec<ParentThread> = match config.child_launch {
            config::ChildLaunchModel::Dtbl | config::ChildLaunchModel::Dkc => {
                child_kernel.parent_threads.clone()
            }
            config::ChildLaunchModel::Cdp => vec![parent.parent_thread()],
        };
        if config.child_launch == config::ChildLaunchModel::Dkc {
            footprint *= child_kernel.metadata_count;
        }

        if child_kernel.parent_child_dependency {
            let child_aware =
                config.child_aware_scheduling && config.child_launch != config::ChildLaunchModel::Cdp;
            let parent_kernel = self.kernel_mut(parent.kernel);
            for thread in waiting {
                parent_kernel.child_finished(thread, child_aware);
            }
        }

        resources.release_param_size(footprint);
        self.remove_child(parent.kernel, child);
        streams.register_finished_kernel(parent.kernel);
        log::debug!(
            "{} finished, released {} bytes of parameter buffer",
            child,
            footprint
        );
    }

    /// Releases the resources of a finished kernel and removes it.
    pub fn destroy(
        &mut self,
        id: KernelId,
        config: &config::GPU,
        resources: &mut resources::ResourceAccounting,
        streams: &mut StreamManager,
    ) -> Option<Kernel> {
        let mut kernel = self.kernels.shift_remove(&id)?;
        kernel.destroy(config, resources, streams);
        Some(kernel)
    }
}
