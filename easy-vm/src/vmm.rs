//! The kernel-facing surface of the memory-management core.

use crate::address::{PhysAddr, PhysPageNum, VirtAddr, VirtPageNum};
use crate::address_space::AddressSpace;
use crate::config::{ReplacementPolicy, VmConfig, PAGE_SIZE};
use crate::error::{Result, VmError};
use crate::executable::ExecutableLoader;
use crate::fault::{self, Fault};
use crate::frame_allocator::FrameAllocator;
use crate::memory::{PhysicalMemoryManager, VmStats};
use crate::process::{ProcessId, RecycleAllocator};
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use log::{info, warn};
use spin::Mutex;

/// Virtual memory of every process of one machine.
///
/// Owns the physical memory manager and the registry of live address
/// spaces. The frame table refers to processes by [`ProcessId`] only, and
/// the registry turns such an id back into an address space while the
/// process lives.
pub struct VirtualMemory {
    loader: Arc<dyn ExecutableLoader>,
    manager: PhysicalMemoryManager,
    processes: Mutex<BTreeMap<ProcessId, Arc<AddressSpace>>>,
    pid_allocator: Mutex<RecycleAllocator>,
}

impl VirtualMemory {
    pub fn new(loader: Arc<dyn ExecutableLoader>, config: VmConfig) -> Self {
        info!(
            "virtual memory: {} frames of {} bytes, {:?} replacement",
            config.num_frames, PAGE_SIZE, config.policy
        );
        Self {
            loader,
            manager: PhysicalMemoryManager::new(config),
            processes: Mutex::new(BTreeMap::new()),
            pid_allocator: Mutex::new(RecycleAllocator::new()),
        }
    }

    pub fn manager(&self) -> &PhysicalMemoryManager {
        &self.manager
    }

    pub fn stats(&self) -> VmStats {
        self.manager.stats()
    }

    /// Address space of a live process.
    pub fn process(&self, pid: ProcessId) -> Result<Arc<AddressSpace>> {
        self.lookup(pid).ok_or(VmError::NoSuchProcess(pid))
    }

    fn lookup(&self, pid: ProcessId) -> Option<Arc<AddressSpace>> {
        self.processes.lock().get(&pid).cloned()
    }

    /// Live processes in id order.
    pub fn pids(&self) -> Vec<ProcessId> {
        self.processes.lock().keys().copied().collect()
    }

    fn register(&self, space: AddressSpace) -> ProcessId {
        let pid = space.pid();
        self.processes.lock().insert(pid, Arc::new(space));
        pid
    }

    fn alloc_pid(&self) -> ProcessId {
        ProcessId(self.pid_allocator.lock().alloc())
    }

    /// Start a process running the executable at `path`.
    pub fn create_process(&self, path: &str) -> Result<ProcessId> {
        let executable = self.loader.open(path)?;
        let pid = self.alloc_pid();
        match AddressSpace::from_executable(pid, executable, self.manager.num_frames()) {
            Ok(space) => {
                info!("{:?}: started from {}", pid, path);
                Ok(self.register(space))
            }
            Err(err) => {
                self.pid_allocator.lock().dealloc(pid.0);
                Err(err)
            }
        }
    }

    /// Create a child process whose address space duplicates `parent`'s.
    ///
    /// Resident private pages are copied into the child's staging buffer,
    /// shared pages are mapped by both processes.
    pub fn duplicate_address_space(&self, parent: ProcessId) -> Result<ProcessId> {
        let parent_space = self.process(parent)?;
        let pid = self.alloc_pid();
        let mut frames = self.manager.exclusive_access();
        if parent_space.inner_exclusive_access().is_exited() {
            drop(frames);
            self.pid_allocator.lock().dealloc(pid.0);
            return Err(VmError::NoSuchProcess(parent));
        }
        let child = match AddressSpace::from_existed_user(
            pid,
            &parent_space,
            self.manager.memory(),
            self.manager.num_frames(),
        ) {
            Ok(child) => child,
            Err(err) => {
                drop(frames);
                self.pid_allocator.lock().dealloc(pid.0);
                return Err(err);
            }
        };
        for ppn in child.inner_exclusive_access().shared_frames() {
            frames.allocator.table_mut().get_mut(ppn).share_count += 1;
        }
        drop(frames);
        info!("{:?}: forked from {:?}", pid, parent);
        Ok(self.register(child))
    }

    /// Extend `pid`'s address space with `bytes` of shared memory, rounded
    /// up to whole pages, backed by pinned zeroed frames.
    ///
    /// # Return
    /// The virtual address of the new region. A request for zero bytes
    /// returns the current end of the address space.
    pub fn allocate_shared_memory(&self, pid: ProcessId, bytes: usize) -> Result<VirtAddr> {
        let space = self.process(pid)?;
        let pages = (bytes + PAGE_SIZE - 1) / PAGE_SIZE;
        let mut frames = self.manager.exclusive_access();
        let inner = space.inner_exclusive_access();
        let base = VirtPageNum(inner.page_count());
        if pages == 0 {
            return Ok(base.into());
        }
        let may_evict = self.manager.policy() == ReplacementPolicy::Fifo;
        let available = if may_evict {
            frames.allocator.obtainable()
        } else {
            frames.allocator.table().free_count()
        };
        if available < pages {
            warn!(
                "{:?}: cannot pin {} frames for shared memory, {} available",
                pid, pages, available
            );
            return Err(VmError::OutOfPhysicalMemory {
                requested: pages,
                available,
            });
        }
        drop(inner);
        let mut pinned = Vec::with_capacity(pages);
        for i in 0..pages {
            let ppn = if may_evict {
                frames.obtain(|owner| self.lookup(owner))
            } else {
                frames.allocator.alloc()
            };
            // counted above, and nothing else can take frames while we hold the lock
            let ppn = match ppn {
                Some(ppn) => ppn,
                None => unreachable!(),
            };
            frames
                .allocator
                .claim(ppn, pid, VirtPageNum(base.0 + i), true);
            self.manager.memory().zero(ppn);
            pinned.push(ppn);
        }
        let start = space.inner_exclusive_access().append_shared(&pinned);
        drop(frames);
        info!("{:?}: {} shared pages at {:?}", pid, pages, start);
        Ok(start)
    }

    /// Make the page holding `addr` resident in `pid`'s address space.
    pub fn handle_page_fault(&self, pid: ProcessId, addr: VirtAddr) -> Result<()> {
        let space = self.process(pid)?;
        fault::resolve(&self.manager, space, addr, |owner| self.lookup(owner))
    }

    /// Tear down `pid`'s address space and return its frames.
    ///
    /// Private frames are freed right away. A shared frame is freed when the
    /// last page table mapping it goes away.
    pub fn on_process_exit(&self, pid: ProcessId) -> Result<()> {
        let space = self
            .processes
            .lock()
            .remove(&pid)
            .ok_or(VmError::NoSuchProcess(pid))?;
        let resident = space.inner_exclusive_access().recycle_data_pages();
        let mut frames = self.manager.exclusive_access();
        for (vpn, ppn, shared) in resident {
            if shared {
                let entry = frames.allocator.table_mut().get_mut(ppn);
                entry.share_count -= 1;
                if entry.share_count == 0 {
                    frames.allocator.dealloc(ppn);
                }
            } else if frames.allocator.table().get(ppn).is_owned_by(pid, vpn) {
                frames.allocator.dealloc(ppn);
            }
        }
        drop(frames);
        self.pid_allocator.lock().dealloc(pid.0);
        info!("{:?}: exited", pid);
        Ok(())
    }

    /// Translate `va` as the machine does on an access: sets the used bit,
    /// and the dirty bit when `write` is set.
    pub fn translate(
        &self,
        pid: ProcessId,
        va: VirtAddr,
        write: bool,
    ) -> core::result::Result<PhysAddr, Fault> {
        let space = self.process(pid)?;
        let mut inner = space.inner_exclusive_access();
        inner.access(va, write)?.ok_or(Fault::PageFault(va))
    }

    /// Physical address currently backing `va`, or `None` when the page is
    /// not resident. Does not touch the used or dirty bits.
    pub fn physical_address(&self, pid: ProcessId, va: VirtAddr) -> Result<Option<PhysAddr>> {
        let space = self.process(pid)?;
        let inner = space.inner_exclusive_access();
        if !inner.contains(va.floor()) {
            return Err(VmError::AddressOutOfRange(va));
        }
        Ok(inner.translate(va.floor()).and_then(|pte| pte.frame()).map(|ppn| {
            let pa: PhysAddr = ppn.into();
            PhysAddr(pa.0 + va.page_offset())
        }))
    }

    /// Run `f` on the physical address of `va` while the page is resident,
    /// resolving page faults until it is.
    fn with_page<R>(
        &self,
        pid: ProcessId,
        va: VirtAddr,
        write: bool,
        f: impl FnOnce(PhysAddr) -> R,
    ) -> Result<R> {
        let space = self.process(pid)?;
        loop {
            {
                let mut inner = space.inner_exclusive_access();
                if let Some(pa) = inner.access(va, write)? {
                    // an eviction has to take this lock to unmap the page
                    return Ok(f(pa));
                }
            }
            fault::resolve(&self.manager, space.clone(), va, |owner| self.lookup(owner))?;
        }
    }

    /// Copy `buf.len()` bytes of `pid`'s memory starting at `va` into `buf`.
    pub fn read_mem(&self, pid: ProcessId, va: VirtAddr, buf: &mut [u8]) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let addr = VirtAddr(va.0 + done);
            let len = (PAGE_SIZE - addr.page_offset()).min(buf.len() - done);
            let chunk = &mut buf[done..done + len];
            self.with_page(pid, addr, false, |pa| self.manager.memory().read(pa, chunk))?;
            done += len;
        }
        Ok(())
    }

    /// Copy `data` into `pid`'s memory starting at `va`.
    pub fn write_mem(&self, pid: ProcessId, va: VirtAddr, data: &[u8]) -> Result<()> {
        let mut done = 0;
        while done < data.len() {
            let addr = VirtAddr(va.0 + done);
            let len = (PAGE_SIZE - addr.page_offset()).min(data.len() - done);
            let chunk = &data[done..done + len];
            self.with_page(pid, addr, true, |pa| self.manager.memory().write(pa, chunk))?;
            done += len;
        }
        Ok(())
    }

    pub fn read_u32(&self, pid: ProcessId, va: VirtAddr) -> Result<u32> {
        let mut bytes = [0u8; 4];
        self.read_mem(pid, va, &mut bytes)?;
        Ok(u32::from_le_bytes(bytes))
    }

    pub fn write_u32(&self, pid: ProcessId, va: VirtAddr, value: u32) -> Result<()> {
        self.write_mem(pid, va, &value.to_le_bytes())
    }

    /// Frames currently pinned on behalf of `pid`'s shared pages.
    pub fn shared_frames(&self, pid: ProcessId) -> Result<Vec<PhysPageNum>> {
        let space = self.process(pid)?;
        let frames = space.inner_exclusive_access().shared_frames().collect();
        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executable::MemoryLoader;
    use crate::noff::{NoffHeader, Segment, NOFF_HEADER_SIZE};
    use alloc::collections::BTreeSet;
    use alloc::vec;
    use pretty_assertions::assert_eq;
    use rand::{Rng, SeedableRng};

    /// A program whose code is `code` and that has `data` initialized bytes
    /// placed right after it.
    fn image(code: &[u8], data: &[u8]) -> Vec<u8> {
        let base = NOFF_HEADER_SIZE as u32;
        let header = NoffHeader::new(
            Segment::new(0, base, code.len() as u32),
            Segment::new(code.len() as u32, base + code.len() as u32, data.len() as u32),
            Segment::default(),
        );
        let mut bytes = header.to_bytes().to_vec();
        bytes.extend_from_slice(code);
        bytes.extend_from_slice(data);
        bytes
    }

    fn machine(frames: usize, programs: &[(&str, Vec<u8>)]) -> VirtualMemory {
        let loader = MemoryLoader::new();
        for (path, bytes) in programs {
            loader.insert(path, bytes.clone());
        }
        VirtualMemory::new(Arc::new(loader), VmConfig::new(frames, ReplacementPolicy::Fifo))
    }

    fn page(vpn: usize) -> VirtAddr {
        VirtAddr(vpn * PAGE_SIZE)
    }

    fn check_ownership(vm: &VirtualMemory) {
        let frames = vm.manager().exclusive_access();
        let table = frames.allocator.table();
        let mut private = BTreeSet::new();
        for pid in vm.pids() {
            let space = vm.process(pid).unwrap();
            let inner = space.inner_exclusive_access();
            for pte in inner.page_table().iter() {
                if let Some(ppn) = pte.frame() {
                    let entry = table.get(ppn);
                    assert!(entry.in_use);
                    if pte.is_shared() {
                        assert!(entry.pinned);
                    } else {
                        assert!(entry.is_owned_by(pid, pte.vpn));
                        assert!(private.insert(ppn), "{:?} mapped twice", ppn);
                    }
                }
            }
        }
        assert!(table.in_use_count() <= table.len());
        for ppn in frames.allocator.queue() {
            assert!(!table.get(ppn).pinned);
        }
    }

    #[test]
    fn unknown_program_and_process() {
        let vm = machine(8, &[]);
        assert_eq!(vm.create_process("halt"), Err(VmError::NotFound));
        assert_eq!(
            vm.handle_page_fault(ProcessId(3), page(0)),
            Err(VmError::NoSuchProcess(ProcessId(3)))
        );
        assert_eq!(
            vm.on_process_exit(ProcessId(0)),
            Err(VmError::NoSuchProcess(ProcessId(0)))
        );
    }

    #[test]
    fn program_too_large_for_memory() {
        let vm = machine(4, &[("big", image(&[0u8; 64], &[]))]);
        assert!(matches!(
            vm.create_process("big"),
            Err(VmError::ExhaustedAddressSpaceBudget { .. })
        ));
        assert!(vm.pids().is_empty());
    }

    #[test]
    fn translate_raises_page_fault_then_succeeds() {
        let vm = machine(16, &[("prog", image(&[1, 2, 3, 4], &[5, 6]))]);
        let pid = vm.create_process("prog").unwrap();
        assert_eq!(vm.translate(pid, VirtAddr(5), false), Err(Fault::PageFault(VirtAddr(5))));
        assert_eq!(vm.physical_address(pid, VirtAddr(5)), Ok(None));
        vm.handle_page_fault(pid, VirtAddr(5)).unwrap();
        let pa = vm.translate(pid, VirtAddr(5), false).unwrap();
        assert_eq!(vm.physical_address(pid, VirtAddr(5)), Ok(Some(pa)));
        let mut buf = [0u8; 6];
        vm.read_mem(pid, VirtAddr(0), &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4, 5, 6]);
        let end = vm.process(pid).unwrap().inner_exclusive_access().page_count();
        assert_eq!(
            vm.translate(pid, page(end), false),
            Err(Fault::Exception(VmError::AddressOutOfRange(page(end))))
        );
        assert_eq!(vm.stats().page_faults, 1);
    }

    #[test]
    fn fault_in_order_evicts_fifo() {
        let vm = machine(3, &[("prog", image(&[0u8; 4], &[]))]);
        let pid = vm.create_process("prog").unwrap();
        for vpn in 0..3 {
            vm.handle_page_fault(pid, page(vpn)).unwrap();
        }
        let resident = |vpn| vm.physical_address(pid, page(vpn)).unwrap().is_some();
        vm.handle_page_fault(pid, page(3)).unwrap();
        assert!(!resident(0) && resident(1) && resident(2) && resident(3));
        vm.handle_page_fault(pid, page(4)).unwrap();
        assert!(!resident(1));
        vm.handle_page_fault(pid, page(0)).unwrap();
        assert!(!resident(2) && resident(0));
        assert_eq!(vm.stats().evictions, 3);
        check_ownership(&vm);
    }

    #[test]
    fn evicted_page_content_is_not_written_back() {
        let vm = machine(2, &[("prog", image(&[7u8; 4], &[]))]);
        let pid = vm.create_process("prog").unwrap();
        vm.write_mem(pid, VirtAddr(0), &[1]).unwrap();
        vm.handle_page_fault(pid, page(1)).unwrap();
        vm.handle_page_fault(pid, page(2)).unwrap();
        assert_eq!(vm.physical_address(pid, page(0)), Ok(None));
        assert_eq!(vm.read_u32(pid, VirtAddr(0)).unwrap(), 0x0707_0707);
    }

    #[test]
    fn fork_stages_resident_pages() {
        let vm = machine(16, &[("prog", image(&[0xab; PAGE_SIZE], &[]))]);
        let parent = vm.create_process("prog").unwrap();
        vm.write_mem(parent, VirtAddr(0), b"parent").unwrap();
        let child = vm.duplicate_address_space(parent).unwrap();
        {
            let space = vm.process(child).unwrap();
            let inner = space.inner_exclusive_access();
            let pte = inner.page_table().find_pte(VirtPageNum(0)).unwrap();
            assert!(!pte.is_valid() && pte.is_staged() && pte.is_dirty());
            let untouched = inner.page_table().find_pte(VirtPageNum(1)).unwrap();
            assert!(!untouched.is_staged());
        }
        vm.write_mem(parent, VirtAddr(0), b"PARENT").unwrap();
        let mut buf = [0u8; PAGE_SIZE];
        vm.read_mem(child, VirtAddr(0), &mut buf).unwrap();
        assert_eq!(&buf[..6], b"parent");
        assert!(buf[6..].iter().all(|&b| b == 0xab));
        check_ownership(&vm);
    }

    #[test]
    fn one_page_program_fork_then_child_writes() {
        let vm = machine(16, &[("one", image(&[0x11; PAGE_SIZE], &[]))]);
        let parent = vm.create_process("one").unwrap();
        vm.handle_page_fault(parent, page(0)).unwrap();
        let child = vm.duplicate_address_space(parent).unwrap();
        vm.write_u32(child, VirtAddr(8), 0xdead_beef).unwrap();
        assert_eq!(vm.read_u32(parent, VirtAddr(8)).unwrap(), 0x1111_1111);
        assert_eq!(vm.read_u32(child, VirtAddr(8)).unwrap(), 0xdead_beef);
        let ppn_of = |pid| vm.physical_address(pid, VirtAddr(0)).unwrap().unwrap().floor();
        assert!(ppn_of(parent) != ppn_of(child));
        check_ownership(&vm);
    }

    #[test]
    fn shared_pages_alias_across_fork() {
        let vm = machine(16, &[("prog", image(&[0u8; 4], &[]))]);
        let parent = vm.create_process("prog").unwrap();
        let before = vm.process(parent).unwrap().inner_exclusive_access().page_count();
        let base = vm.allocate_shared_memory(parent, PAGE_SIZE + 1).unwrap();
        assert_eq!(base, page(before));
        let child = vm.duplicate_address_space(parent).unwrap();
        assert_eq!(vm.shared_frames(parent), vm.shared_frames(child));
        assert_eq!(vm.shared_frames(child).unwrap().len(), 2);
        vm.write_u32(child, base, 42).unwrap();
        assert_eq!(vm.read_u32(parent, base).unwrap(), 42);
        let frames = vm.manager().exclusive_access();
        for ppn in vm.shared_frames(parent).unwrap() {
            assert_eq!(frames.allocator.table().get(ppn).share_count, 2);
        }
    }

    #[test]
    fn zero_byte_shared_request_returns_end() {
        let vm = machine(16, &[("prog", image(&[0u8; 4], &[]))]);
        let pid = vm.create_process("prog").unwrap();
        let end = vm.allocate_shared_memory(pid, 0).unwrap();
        assert_eq!(end, page(9));
        assert_eq!(vm.stats().pinned_frames, 0);
        assert_eq!(vm.process(pid).unwrap().inner_exclusive_access().page_count(), 9);
    }

    #[test]
    fn shared_request_beyond_memory_leaves_space_unchanged() {
        let vm = machine(12, &[("prog", image(&[0u8; 4], &[]))]);
        let pid = vm.create_process("prog").unwrap();
        vm.allocate_shared_memory(pid, 10 * PAGE_SIZE).unwrap();
        assert_eq!(
            vm.allocate_shared_memory(pid, 3 * PAGE_SIZE),
            Err(VmError::OutOfPhysicalMemory {
                requested: 3,
                available: 2
            })
        );
        let space = vm.process(pid).unwrap();
        let inner = space.inner_exclusive_access();
        assert_eq!(inner.page_count(), 19);
        assert_eq!(inner.shared_page_count(), 10);
    }

    #[test]
    fn shared_memory_survives_eviction_pressure() {
        let vm = machine(12, &[("prog", image(&[0x5a; 2 * PAGE_SIZE], &[]))]);
        let pid = vm.create_process("prog").unwrap();
        let base = vm.allocate_shared_memory(pid, 2 * PAGE_SIZE).unwrap();
        let pattern: Vec<u8> = (0..2 * PAGE_SIZE).map(|i| (i * 7) as u8).collect();
        vm.write_mem(pid, base, &pattern).unwrap();
        let pinned = vm.shared_frames(pid).unwrap();
        let other = vm.duplicate_address_space(pid).unwrap();

        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);
        let private_pages = base.floor().0;
        for _ in 0..500 {
            let who = if rng.gen_bool(0.5) { pid } else { other };
            let vpn = rng.gen_range(0..private_pages);
            if rng.gen_bool(0.3) {
                vm.write_u32(who, page(vpn), rng.gen()).unwrap();
            } else {
                vm.read_u32(who, page(vpn)).unwrap();
            }
        }
        assert!(vm.stats().evictions > 0);
        assert_eq!(vm.shared_frames(pid).unwrap(), pinned);
        let mut buf = vec![0u8; 2 * PAGE_SIZE];
        vm.read_mem(other, base, &mut buf).unwrap();
        assert_eq!(buf, pattern);
        check_ownership(&vm);
    }

    #[test]
    fn shmtest_two_children_increment_different_fields() {
        let vm = machine(32, &[("shmtest", image(&[0u8; 64], &[]))]);
        let parent = vm.create_process("shmtest").unwrap();
        let shm = vm.allocate_shared_memory(parent, 3 * 4).unwrap();
        assert_eq!(vm.stats().pinned_frames, 1);
        let first = vm.duplicate_address_space(parent).unwrap();
        let second = vm.duplicate_address_space(parent).unwrap();
        for (child, field) in [(first, 0), (second, 1)] {
            for _ in 0..5 {
                let addr = VirtAddr(shm.0 + field * 4);
                let value = vm.read_u32(child, addr).unwrap();
                vm.write_u32(child, addr, value + 1).unwrap();
            }
        }
        let fields: Vec<u32> = (0..3)
            .map(|i| vm.read_u32(parent, VirtAddr(shm.0 + i * 4)).unwrap())
            .collect();
        assert_eq!(fields, [5, 5, 0]);
        check_ownership(&vm);
        let pinned = vm.shared_frames(parent).unwrap()[0];
        assert!(vm.manager().exclusive_access().allocator.queue().all(|ppn| ppn != pinned));
    }

    #[test]
    fn exit_frees_private_frames_and_last_shared_reference() {
        let vm = machine(16, &[("prog", image(&[0u8; 4], &[]))]);
        let parent = vm.create_process("prog").unwrap();
        vm.allocate_shared_memory(parent, 4).unwrap();
        vm.handle_page_fault(parent, page(0)).unwrap();
        let child = vm.duplicate_address_space(parent).unwrap();
        vm.handle_page_fault(child, page(0)).unwrap();
        vm.handle_page_fault(child, page(1)).unwrap();
        assert_eq!(vm.stats().resident_frames, 4);

        vm.on_process_exit(parent).unwrap();
        let stats = vm.stats();
        assert_eq!((stats.resident_frames, stats.pinned_frames), (3, 1));
        vm.on_process_exit(child).unwrap();
        let stats = vm.stats();
        assert_eq!((stats.resident_frames, stats.pinned_frames), (0, 0));
        assert!(vm.manager().exclusive_access().allocator.queue().next().is_none());
        // ids are recycled
        assert_eq!(vm.create_process("prog"), Ok(ProcessId(1)));
    }

    #[test]
    fn stale_admission_after_pid_reuse_is_dropped() {
        let vm = machine(16, &[("prog", image(&[0x42; 4], &[]))]);
        let pid = vm.create_process("prog").unwrap();
        let populated = fault::Faulted::new(vm.manager(), vm.process(pid).unwrap(), page(0))
            .unwrap()
            .unwrap()
            .obtain_frame(|owner| vm.lookup(owner))
            .populate()
            .unwrap()
            .unwrap();
        vm.on_process_exit(pid).unwrap();
        assert_eq!(vm.create_process("prog"), Ok(pid));
        vm.handle_page_fault(pid, page(0)).unwrap();
        let reused = vm.physical_address(pid, page(0)).unwrap().unwrap().floor();
        assert_eq!(reused, PhysPageNum(0));

        populated.admit();
        let queue: Vec<_> = vm.manager().exclusive_access().allocator.queue().collect();
        assert_eq!(queue, [reused]);
        assert_eq!(vm.read_u32(pid, VirtAddr(0)).unwrap(), 0x4242_4242);
        check_ownership(&vm);
    }

    #[test]
    fn concurrent_children_fault_through_two_evictable_frames() {
        let code: Vec<u8> = (0..PAGE_SIZE).map(|i| i as u8).collect();
        let vm = machine(12, &[("prog", image(&code, &[]))]);
        let parent = vm.create_process("prog").unwrap();
        let shm = vm.allocate_shared_memory(parent, 10 * PAGE_SIZE).unwrap();
        let private_pages = shm.floor().0;
        assert_eq!(vm.stats().pinned_frames, 10);
        let children: Vec<_> = (0..6)
            .map(|_| vm.duplicate_address_space(parent).unwrap())
            .collect();

        std::thread::scope(|s| {
            for (i, &child) in children.iter().enumerate() {
                let vm = &vm;
                s.spawn(move || {
                    let counter = VirtAddr(shm.0 + i * 4);
                    for _ in 0..3 {
                        for vpn in 0..private_pages {
                            let expected = if vpn == 0 { 0x0302_0100 } else { 0 };
                            assert_eq!(vm.read_u32(child, page(vpn)).unwrap(), expected);
                        }
                        let value = vm.read_u32(child, counter).unwrap();
                        vm.write_u32(child, counter, value + 1).unwrap();
                    }
                    vm.on_process_exit(child).unwrap();
                });
            }
        });

        assert_eq!(vm.pids(), [parent]);
        for i in 0..children.len() {
            assert_eq!(vm.read_u32(parent, VirtAddr(shm.0 + i * 4)).unwrap(), 3);
        }
        let stats = vm.stats();
        assert_eq!((stats.resident_frames, stats.pinned_frames), (10, 10));
        assert!(stats.evictions > 0);
        assert!(vm.manager().exclusive_access().allocator.queue().next().is_none());
        check_ownership(&vm);
    }

    #[test]
    fn random_workload_keeps_private_frames_disjoint() {
        let vm = machine(10, &[("prog", image(&[0x33; PAGE_SIZE], &[1, 2, 3]))]);
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let mut live = vec![vm.create_process("prog").unwrap()];
        for step in 0..300 {
            let pid = live[rng.gen_range(0..live.len())];
            match rng.gen_range(0..10) {
                0 if live.len() < 4 => live.push(vm.duplicate_address_space(pid).unwrap()),
                1 if live.len() > 1 => {
                    vm.on_process_exit(pid).unwrap();
                    live.retain(|&p| p != pid);
                }
                _ => {
                    let vpn = rng.gen_range(0..10);
                    vm.write_u32(pid, page(vpn), step).unwrap();
                }
            }
            check_ownership(&vm);
        }
    }
}
