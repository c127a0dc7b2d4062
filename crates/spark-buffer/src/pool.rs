use std::{
    collections::HashMap,
    mem,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::{block::alloc_block, config::PoolConfig, error::BufferError};

/// `BlockPool` 是按尺寸类别缓存缓冲块的进程级共享池。
///
/// # 模块角色（Why）
/// - 解码器在每次轮换、每次重新获取暂存区时都需要一整块内存，
///   直接走系统分配器会在高吞吐连接上造成明显抖动；
/// - 池以“尺寸类别 + 条目登记表”的方式复用已释放的块，使多个解码器、多个线程之间
///   共享同一份内存预算。
///
/// # 核心机制（How）
/// - 内部以 `parking_lot::Mutex<PoolState>` 保护全部簿记：各尺寸类别的条目表、空闲下标列表，
///   以及“块地址 → (类别, 下标)”的反查表；
/// - 新内存的分配与被驱逐内存的释放都在临界区之外完成，锁内只做簿记；
/// - `PoolMetrics` 以原子计数记录新分配、复用、驱逐、外来释放次数，支撑 [`BlockPool::stats`]。
///
/// # 契约说明（What）
/// - **复用**：同一尺寸类别下，`allocate → deallocate → allocate` 返回同一块内存；
/// - **驱逐**：`set_buffer_size` 切换类别时，其它类别的空闲块立即释放；
///   正在使用中的旧类别块在下一次 `deallocate` 时释放而不是缓存；
/// - **外来块**：`deallocate` 收到不认识的块时直接释放并返回 `false`。
///
/// # 设计权衡（Trade-offs）
/// - 所有操作都是短小的阻塞临界区，没有无锁快路径；选择 `parking_lot` 而非自旋锁，
///   因为缓冲块获取处在每连接的热路径上，竞争时应当让出 CPU；
/// - `reset` 只能清空池自身持有的登记，仍被外部持有的块会在释放时按“外来块”处理，
///   保证不会出现悬垂释放。
#[derive(Clone)]
pub struct BlockPool {
    inner: Arc<PoolInner>,
}

impl Default for BlockPool {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BlockPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockPool")
            .field("buffer_size", &self.buffer_size())
            .finish_non_exhaustive()
    }
}

impl BlockPool {
    /// 以缺省配置（350 000 字节尺寸类别）创建池。
    pub fn new() -> Self {
        Self::from_parts(&PoolConfig::default())
    }

    /// 按配置创建池，并为初始尺寸类别预留 `expected_count` 个条目。
    pub fn with_config(config: &PoolConfig) -> Result<Self, BufferError> {
        config.validate()?;
        Ok(Self::from_parts(config))
    }

    fn from_parts(config: &PoolConfig) -> Self {
        let mut classes = HashMap::new();
        classes.insert(
            config.buffer_size,
            SizeClass::with_capacity(config.expected_count),
        );
        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    active: config.buffer_size,
                    epoch: 0,
                    classes,
                    owners: HashMap::new(),
                }),
                metrics: PoolMetrics::default(),
            }),
        }
    }

    /// 当前活动尺寸类别。
    pub fn buffer_size(&self) -> usize {
        self.inner.state.lock().active
    }

    /// 切换活动尺寸类别。
    ///
    /// # 参数与契约
    /// - `size`：新的尺寸类别，必须大于 0；
    /// - `expected_count`：若该类别尚未登记，为其条目表预留的容量；
    /// - **后置条件**：其它类别下所有空闲块已被释放；使用中的块保持原样，
    ///   它们在归还时会因类别不匹配而被直接释放。
    pub fn set_buffer_size(&self, size: usize, expected_count: usize) -> Result<(), BufferError> {
        if size == 0 {
            return Err(BufferError::InvalidSize {
                size,
                reason: "pool size class must be non-zero",
            });
        }

        let evicted = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            state.active = size;
            state
                .classes
                .entry(size)
                .or_insert_with(|| SizeClass::with_capacity(expected_count));

            let mut evicted = Vec::new();
            for (&class_size, class) in state.classes.iter_mut() {
                if class_size == size {
                    continue;
                }
                for &index in &class.idle {
                    if let Some(block) = class.entries[index].take_idle() {
                        state.owners.remove(&block_addr(&block));
                        evicted.push(block);
                    }
                }
            }
            evicted
        };

        self.inner
            .metrics
            .evictions
            .fetch_add(evicted.len() as u64, Ordering::Relaxed);
        debug!(
            size,
            expected_count,
            evicted = evicted.len(),
            "pool size class switched"
        );
        drop(evicted);
        Ok(())
    }

    /// 租借一个活动尺寸类别的缓冲块。
    ///
    /// 返回块的长度即实际获得的尺寸。优先复用空闲条目；否则在锁外分配新内存，
    /// 再回到临界区登记。分配失败会终止进程（见 [`alloc_block`]）。
    pub fn allocate(&self) -> Box<[u8]> {
        let (size, epoch, reserved) = {
            let mut state = self.inner.state.lock();
            let size = state.active;
            let epoch = state.epoch;
            let class = state.classes.entry(size).or_default();
            match class.idle.pop() {
                Some(index) => match mem::replace(&mut class.entries[index], Entry::InUse) {
                    Entry::Idle(block) => {
                        self.inner.metrics.reuses.fetch_add(1, Ordering::Relaxed);
                        return block;
                    }
                    // 条目曾在空闲状态下被驱逐，下标保留，需要为它重新分配内存。
                    Entry::Vacant => (size, epoch, Some(index)),
                    Entry::InUse => {
                        debug_assert!(false, "idle list referenced an in-use entry");
                        (size, epoch, None)
                    }
                },
                None => (size, epoch, None),
            }
        };

        let block = alloc_block(size);
        let addr = block_addr(&block);

        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        let same_epoch = state.epoch == epoch;
        let class = state.classes.entry(size).or_default();
        let index = match reserved {
            Some(index) if same_epoch && index < class.entries.len() => index,
            _ => {
                class.entries.push(Entry::InUse);
                class.entries.len() - 1
            }
        };
        state.owners.insert(addr, Owner { class: size, index });
        drop(guard);

        self.inner
            .metrics
            .fresh_allocations
            .fetch_add(1, Ordering::Relaxed);
        trace!(size, index, "fresh pool block");
        block
    }

    /// 归还缓冲块。
    ///
    /// - 认识该块：标记为空闲；若其类别已不是活动类别则立即释放；返回 `true`；
    /// - 不认识该块：视为调用方自行分配的内存，直接释放并返回 `false`。
    pub fn deallocate(&self, block: Box<[u8]>) -> bool {
        let addr = block_addr(&block);
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;

        let Some(owner) = state.owners.get(&addr).copied() else {
            drop(guard);
            self.inner
                .metrics
                .foreign_releases
                .fetch_add(1, Ordering::Relaxed);
            warn!(len = block.len(), "releasing a block the pool does not own");
            drop(block);
            return false;
        };

        let stale = owner.class != state.active;
        let Some(class) = state.classes.get_mut(&owner.class) else {
            // 登记表与反查表不一致只可能来自实现缺陷；退化为直接释放。
            debug_assert!(false, "owner map points at a missing size class");
            state.owners.remove(&addr);
            return true;
        };
        class.idle.push(owner.index);

        if stale {
            class.entries[owner.index] = Entry::Vacant;
            state.owners.remove(&addr);
            drop(guard);
            self.inner.metrics.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(
                class = owner.class,
                index = owner.index,
                "evicted block of an inactive size class on release"
            );
            drop(block);
        } else {
            class.entries[owner.index] = Entry::Idle(block);
        }
        true
    }

    /// 销毁池中全部登记。
    ///
    /// **仅用于关停阶段**：调用后池忘记所有条目，空闲块立即释放；
    /// 仍被外部持有的块在之后归还时会被当作外来块直接释放。
    pub fn reset(&self) {
        let released: Vec<Box<[u8]>> = {
            let mut state = self.inner.state.lock();
            state.epoch += 1;
            state.owners.clear();
            let classes = mem::take(&mut state.classes);
            classes
                .into_values()
                .flat_map(|class| class.entries)
                .filter_map(|entry| match entry {
                    Entry::Idle(block) => Some(block),
                    Entry::InUse | Entry::Vacant => None,
                })
                .collect()
        };
        debug!(released = released.len(), "pool reset");
    }

    /// 读取统计快照。
    pub fn stats(&self) -> PoolStats {
        let (buffer_size, size_classes, idle_blocks, in_use_blocks) = {
            let state = self.inner.state.lock();
            let mut idle = 0;
            let mut in_use = 0;
            for class in state.classes.values() {
                for entry in &class.entries {
                    match entry {
                        Entry::Idle(_) => idle += 1,
                        Entry::InUse => in_use += 1,
                        Entry::Vacant => {}
                    }
                }
            }
            (state.active, state.classes.len(), idle, in_use)
        };
        let metrics = &self.inner.metrics;
        PoolStats {
            buffer_size,
            size_classes,
            idle_blocks,
            in_use_blocks,
            fresh_allocations: metrics.fresh_allocations.load(Ordering::Relaxed),
            reuses: metrics.reuses.load(Ordering::Relaxed),
            evictions: metrics.evictions.load(Ordering::Relaxed),
            foreign_releases: metrics.foreign_releases.load(Ordering::Relaxed),
        }
    }
}

/// 池的统计快照。
///
/// `idle_blocks` 与 `in_use_blocks` 只统计仍登记在池中的条目；
/// 计数类字段自池创建以来单调递增。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub buffer_size: usize,
    pub size_classes: usize,
    pub idle_blocks: usize,
    pub in_use_blocks: usize,
    pub fresh_allocations: u64,
    pub reuses: u64,
    pub evictions: u64,
    pub foreign_releases: u64,
}

struct PoolInner {
    state: Mutex<PoolState>,
    metrics: PoolMetrics,
}

struct PoolState {
    active: usize,
    /// `reset` 之后递增，用于识别锁外分配期间失效的预留下标。
    epoch: u64,
    classes: HashMap<usize, SizeClass>,
    owners: HashMap<usize, Owner>,
}

#[derive(Debug, Clone, Copy)]
struct Owner {
    class: usize,
    index: usize,
}

#[derive(Default)]
struct SizeClass {
    entries: Vec<Entry>,
    idle: Vec<usize>,
}

impl SizeClass {
    fn with_capacity(expected_count: usize) -> Self {
        Self {
            entries: Vec::with_capacity(expected_count),
            idle: Vec::with_capacity(expected_count),
        }
    }
}

enum Entry {
    Idle(Box<[u8]>),
    InUse,
    /// 空闲时被驱逐：内存已释放，下标仍留在空闲列表中等待复用。
    Vacant,
}

impl Entry {
    fn take_idle(&mut self) -> Option<Box<[u8]>> {
        match mem::replace(self, Entry::Vacant) {
            Entry::Idle(block) => Some(block),
            other => {
                *self = other;
                None
            }
        }
    }
}

#[derive(Default)]
struct PoolMetrics {
    fresh_allocations: AtomicU64,
    reuses: AtomicU64,
    evictions: AtomicU64,
    foreign_releases: AtomicU64,
}

fn block_addr(block: &[u8]) -> usize {
    block.as_ptr() as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn small_pool(size: usize) -> BlockPool {
        BlockPool::with_config(&PoolConfig {
            buffer_size: size,
            expected_count: 4,
        })
        .expect("构造测试池")
    }

    #[test]
    fn released_block_is_handed_out_again() {
        let pool = small_pool(128);
        let first = pool.allocate();
        assert_eq!(first.len(), 128);
        let addr = block_addr(&first);
        assert!(pool.deallocate(first));

        let second = pool.allocate();
        assert_eq!(block_addr(&second), addr, "同类别下必须复用同一块内存");
        let stats = pool.stats();
        assert_eq!(stats.fresh_allocations, 1);
        assert_eq!(stats.reuses, 1);
        assert_eq!(stats.in_use_blocks, 1);
        assert!(pool.deallocate(second));
    }

    #[test]
    fn vacant_slot_is_refilled_after_eviction() {
        let pool = small_pool(64);
        let block = pool.allocate();
        assert!(pool.deallocate(block));
        pool.set_buffer_size(32, 2).expect("切换类别");
        pool.set_buffer_size(64, 2).expect("切回类别");

        let stats = pool.stats();
        assert_eq!(stats.idle_blocks, 0, "空闲块已在类别切换时被释放");

        let refill = pool.allocate();
        assert_eq!(refill.len(), 64);
        let stats = pool.stats();
        assert_eq!(stats.fresh_allocations, 2);
        assert_eq!(stats.in_use_blocks, 1);
        assert!(pool.deallocate(refill));
    }

    #[test]
    fn zero_size_class_is_rejected() {
        let pool = small_pool(64);
        let err = pool.set_buffer_size(0, 1).unwrap_err();
        assert_eq!(err.code(), crate::codes::BUFFER_INVALID_SIZE);
        assert_eq!(pool.buffer_size(), 64);
    }

    #[test]
    #[traced_test]
    fn eviction_and_foreign_release_are_logged() {
        let pool = small_pool(48);
        let block = pool.allocate();
        assert!(pool.deallocate(block));
        pool.set_buffer_size(96, 1).expect("切换类别");
        assert!(logs_contain("pool size class switched"));

        assert!(!pool.deallocate(vec![0u8; 16].into_boxed_slice()));
        assert!(logs_contain("does not own"));
    }
}
