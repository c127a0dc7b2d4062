use std::{mem, ops::Range, sync::Arc};

use tracing::{debug, trace};

use crate::{
    block::{BlockHandle, BlockOrigin, SharedBlock, alloc_block},
    config::AllocatorConfig,
    error::BufferError,
    pool::BlockPool,
    view::MessageView,
};

/// 最小内联消息尺寸：短于它的消息由消息对象内联保存，不会占用槽位。
/// 缺省槽位数因此取 `ceil(capacity / INLINE_MESSAGE_THRESHOLD)`。
pub const INLINE_MESSAGE_THRESHOLD: usize = 33;

/// 池化模式下每个缓冲块为引用计数头预留的字节数。
pub const HEADER_FOOTPRINT: usize = mem::size_of::<usize>();

/// 池化模式下每个槽位在缓冲块中预留的字节数。
pub const SLOT_FOOTPRINT: usize = mem::size_of::<SlotDescriptor>();

/// 消息视图槽位：接收区内的偏移与长度。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlotDescriptor {
    pub offset: usize,
    pub len: usize,
}

/// 分配器统计。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllocatorStats {
    /// 新获取的缓冲块数量（堆分配或池租借）。
    pub blocks_acquired: u64,
    /// 无外部持有、原地复用当前块的次数。
    pub blocks_reused: u64,
    /// 因仍有消息视图而放手当前块的次数。
    pub blocks_detached: u64,
    /// 槽位耗尽触发的轮换次数。
    pub rotations: u64,
    /// 切分出的共享视图数量。
    pub views_carved: u64,
}

enum BlockSource {
    Heap { capacity: usize },
    Pool(BlockPool),
}

/// `ZeroCopyAllocator` 把一个接收缓冲块切分成多个零拷贝消息视图。
///
/// # 模块角色（Why）
/// - 传输层把字节直接读进分配器持有的接收区，解码器随后把完整消息切成指向同一块内存的视图，
///   消息体因此无需复制；
/// - 缓冲块由分配器与所有存活视图共同持有，最后一份持有消失时才回到池中或被释放。
///
/// # 核心机制（How）
/// - 当前块以 `Arc<SharedBlock>` 持有，`Arc` 的强计数即块的引用计数；
/// - `slots` 记录本块已切分的视图，`slot_cursor` 指向下一个槽位，最多 `max_slots` 个；
/// - `sealed` 是封存水位：所有视图都落在它之下，分配器只向水位之上写入，
///   这保证了视图读取与后续接收可以在不同线程并发进行；
/// - 槽位耗尽时在 [`advance_content`](Self::advance_content) 中轮换到新块，
///   尚未成帧的尾部字节被复制到新块开头。
///
/// # 契约说明（What）
/// - [`data`](Self::data)/[`size`](Self::size) 只描述接收区，不含任何簿记；
/// - 只要当前块仍有外部持有，[`allocate`](Self::allocate) 就不会复用它；
/// - 分配器本身不是线程安全的，归单个流独占；可跨线程的是它产出的视图与句柄。
///
/// # 设计权衡（Trade-offs）
/// - 槽位表放在分配器内而不是缓冲块内，池化模式仍按 `头部 + 槽位表` 从块长度中扣除预留，
///   使接收区容量与块尺寸类别之间的换算保持稳定。
pub struct ZeroCopyAllocator {
    source: BlockSource,
    max_slots: usize,
    current: Option<Arc<SharedBlock>>,
    region: usize,
    size: usize,
    slots: Vec<SlotDescriptor>,
    slot_cursor: usize,
    sealed: usize,
    stats: AllocatorStats,
}

impl ZeroCopyAllocator {
    /// 直接堆分配模式，槽位数按容量推导。
    pub fn new(capacity: usize) -> Result<Self, BufferError> {
        let max_slots = capacity.div_ceil(INLINE_MESSAGE_THRESHOLD).max(1);
        Self::with_max_slots(capacity, max_slots)
    }

    /// 直接堆分配模式，显式给出槽位数。
    pub fn with_max_slots(capacity: usize, max_slots: usize) -> Result<Self, BufferError> {
        if capacity == 0 {
            return Err(BufferError::InvalidSize {
                size: capacity,
                reason: "allocator capacity must be non-zero",
            });
        }
        Self::build(BlockSource::Heap { capacity }, max_slots)
    }

    /// 池化模式：缓冲块尺寸由池的活动类别决定。
    pub fn with_pool(pool: BlockPool, max_slots: usize) -> Result<Self, BufferError> {
        Self::build(BlockSource::Pool(pool), max_slots)
    }

    /// 按配置构造。`use_pool` 为真时必须注入池。
    pub fn from_config(
        config: &AllocatorConfig,
        pool: Option<BlockPool>,
    ) -> Result<Self, BufferError> {
        config.validate()?;
        let derived = config.capacity.div_ceil(INLINE_MESSAGE_THRESHOLD).max(1);
        let max_slots = config.max_slots.unwrap_or(derived);
        match (config.use_pool, pool) {
            (true, Some(pool)) => Self::with_pool(pool, max_slots),
            (true, None) => Err(BufferError::Config(
                "use_pool is set but no BlockPool was supplied".to_owned(),
            )),
            (false, _) => Self::with_max_slots(config.capacity, max_slots),
        }
    }

    fn build(source: BlockSource, max_slots: usize) -> Result<Self, BufferError> {
        if max_slots == 0 {
            return Err(BufferError::InvalidSize {
                size: max_slots,
                reason: "max_slots must be non-zero",
            });
        }
        Ok(Self {
            source,
            max_slots,
            current: None,
            region: 0,
            size: 0,
            slots: Vec::with_capacity(max_slots),
            slot_cursor: 0,
            sealed: 0,
            stats: AllocatorStats::default(),
        })
    }

    /// 准备一个可写的接收区。
    ///
    /// - 当前块没有外部持有：原地复用；
    /// - 当前块仍被消息视图持有：放手（视图继续保活它），改用新块；
    /// - 尚无缓冲块：获取新块。
    ///
    /// 返回后槽位游标与封存水位归零，声明尺寸等于接收区容量。
    pub fn allocate(&mut self) -> Result<(), BufferError> {
        match self.current.as_mut().map(|block| Arc::get_mut(block).is_some()) {
            Some(true) => {
                self.stats.blocks_reused += 1;
                self.rewind();
                return Ok(());
            }
            Some(false) => {
                self.current = None;
                self.stats.blocks_detached += 1;
            }
            None => {}
        }

        let (block, region) = self.acquire()?;
        self.current = Some(Arc::new(block));
        self.region = region;
        self.stats.blocks_acquired += 1;
        self.rewind();
        trace!(region, max_slots = self.max_slots, "acquired receive block");
        Ok(())
    }

    fn acquire(&self) -> Result<(SharedBlock, usize), BufferError> {
        match &self.source {
            BlockSource::Heap { capacity } => Ok((
                SharedBlock::new(alloc_block(*capacity), BlockOrigin::Heap),
                *capacity,
            )),
            BlockSource::Pool(pool) => {
                let block = pool.allocate();
                let required = HEADER_FOOTPRINT + self.max_slots * SLOT_FOOTPRINT;
                if block.len() <= required {
                    let len = block.len();
                    pool.deallocate(block);
                    return Err(BufferError::BlockTooSmall {
                        block: len,
                        required,
                    });
                }
                let region = block.len() - required;
                Ok((SharedBlock::new(block, BlockOrigin::Pool(pool.clone())), region))
            }
        }
    }

    fn rewind(&mut self) {
        self.slots.clear();
        self.slot_cursor = 0;
        self.sealed = 0;
        self.size = self.region;
    }

    /// 接收区 `[0, size)`；未持有缓冲块时为空。
    pub fn data(&self) -> &[u8] {
        match &self.current {
            // SAFETY: `&self` 排除了分配器自身的写者；视图只读。
            Some(block) => unsafe { block.slice(0..self.size) },
            None => &[],
        }
    }

    /// 声明的接收区尺寸。
    pub fn size(&self) -> usize {
        self.size
    }

    /// 当前块接收区的物理容量。
    pub fn capacity(&self) -> usize {
        self.region
    }

    pub fn max_slots(&self) -> usize {
        self.max_slots
    }

    /// 当前块已推进的槽位数。
    pub fn slots_used(&self) -> usize {
        self.slot_cursor
    }

    /// 当前块已记录的槽位。
    pub fn slots(&self) -> &[SlotDescriptor] {
        &self.slots
    }

    /// 封存水位：此偏移之下的字节可能被消息视图引用。
    pub fn sealed(&self) -> usize {
        self.sealed
    }

    /// 当前块除分配器外的持有者数量。
    pub fn outstanding_refs(&self) -> usize {
        self.current
            .as_ref()
            .map_or(0, |block| Arc::strong_count(block) - 1)
    }

    pub fn has_block(&self) -> bool {
        self.current.is_some()
    }

    /// 调整声明尺寸，超过物理容量的部分被截断。
    pub fn resize(&mut self, size: usize) {
        self.size = size.min(self.region);
    }

    /// 接收区 `[from, size)` 的可写视图。
    ///
    /// `from` 不得低于封存水位，以免改写已被消息视图引用的字节。
    pub fn spare_mut(&mut self, from: usize) -> Result<&mut [u8], BufferError> {
        let block = self.current.as_ref().ok_or(BufferError::NoBlock)?;
        if from < self.sealed {
            return Err(BufferError::SealedRegion {
                offset: from,
                sealed: self.sealed,
            });
        }
        if from > self.size {
            return Err(BufferError::OutOfRange {
                start: from,
                end: self.size,
                size: self.size,
            });
        }
        // SAFETY: 所有视图都位于封存水位之下，`&mut self` 排除了分配器内部的其它借用。
        Ok(unsafe { block.slice_mut(from..self.size) })
    }

    /// 在当前槽位上切分出一个零拷贝视图，并把封存水位推到视图末尾。
    ///
    /// 只记录槽位，不推进游标；推进由 [`advance_content`](Self::advance_content) 完成。
    pub fn carve(&mut self, range: Range<usize>) -> Result<MessageView, BufferError> {
        let block = self.current.as_ref().ok_or(BufferError::NoBlock)?;
        if range.start > range.end || range.end > self.size {
            return Err(BufferError::OutOfRange {
                start: range.start,
                end: range.end,
                size: self.size,
            });
        }
        if self.slot_cursor >= self.max_slots {
            return Err(BufferError::SlotsExhausted {
                max_slots: self.max_slots,
            });
        }
        let view = MessageView::shared(BlockHandle(Arc::clone(block)), range.clone());
        self.slots.truncate(self.slot_cursor);
        self.slots.push(SlotDescriptor {
            offset: range.start,
            len: range.len(),
        });
        self.sealed = self.sealed.max(range.end);
        self.stats.views_carved += 1;
        Ok(view)
    }

    /// 推进槽位游标。
    ///
    /// 返回 `true` 表示当前块仍有空闲槽位。槽位耗尽时：放手当前块（由视图保活），
    /// 获取新块，把尾部 `[end_of_message, size)` 复制到新块开头，
    /// 尾部非空时把声明尺寸缩为尾部长度，返回 `false`。
    pub fn advance_content(&mut self, end_of_message: usize) -> Result<bool, BufferError> {
        if self.current.is_none() {
            return Err(BufferError::NoBlock);
        }
        self.slot_cursor += 1;
        if self.slot_cursor < self.max_slots {
            return Ok(true);
        }
        if end_of_message > self.size {
            return Err(BufferError::OutOfRange {
                start: end_of_message,
                end: self.size,
                size: self.size,
            });
        }

        let tail = end_of_message..self.size;
        let old = self.current.take();
        self.allocate()?;
        if !tail.is_empty() {
            self.copy_into_front(old.as_ref(), tail.clone())?;
            self.size = tail.len();
        }
        self.stats.rotations += 1;
        debug!(
            tail = tail.len(),
            max_slots = self.max_slots,
            "slot table exhausted, rotated receive block"
        );
        Ok(false)
    }

    /// 把当前块 `range` 内的字节搬到可写块的开头。
    ///
    /// 当前块没有外部持有时原地移动；否则获取新块再复制，旧块留给视图。
    /// 返回后游标与封存水位归零，声明尺寸等于接收区容量。
    pub fn relocate(&mut self, range: Range<usize>) -> Result<(), BufferError> {
        if range.start > range.end {
            return Err(BufferError::OutOfRange {
                start: range.start,
                end: range.end,
                size: self.region,
            });
        }
        let unique = self.current.as_mut().map(|block| Arc::get_mut(block).is_some());
        match unique {
            Some(true) => {
                if range.end > self.region {
                    return Err(BufferError::OutOfRange {
                        start: range.start,
                        end: range.end,
                        size: self.region,
                    });
                }
                let block = self.current.as_ref().ok_or(BufferError::NoBlock)?;
                // SAFETY: 分配器是唯一持有者，整块都可独占访问。
                let whole = unsafe { block.slice_mut(0..self.region) };
                whole.copy_within(range, 0);
                self.stats.blocks_reused += 1;
                self.rewind();
                Ok(())
            }
            Some(false) => {
                let old = self.current.take();
                self.stats.blocks_detached += 1;
                self.allocate()?;
                self.copy_into_front(old.as_ref(), range)
            }
            None if range.is_empty() => self.allocate(),
            None => Err(BufferError::NoBlock),
        }
    }

    fn copy_into_front(
        &self,
        old: Option<&Arc<SharedBlock>>,
        range: Range<usize>,
    ) -> Result<(), BufferError> {
        if range.is_empty() {
            return Ok(());
        }
        let old = old.ok_or(BufferError::NoBlock)?;
        let block = self.current.as_ref().ok_or(BufferError::NoBlock)?;
        if range.len() > self.region || range.end > old.len() {
            return Err(BufferError::OutOfRange {
                start: range.start,
                end: range.end,
                size: self.region,
            });
        }
        // SAFETY: 旧块已不再被分配器写入，只剩读者；新块刚刚获取或被唯一持有，
        // 且两块不是同一块内存。
        unsafe {
            let src = old.slice(range.clone());
            block.slice_mut(0..range.len()).copy_from_slice(src);
        }
        Ok(())
    }

    /// 增加一份对当前块的持有。
    pub fn inc_ref(&self) -> Option<BlockHandle> {
        self.current
            .as_ref()
            .map(|block| BlockHandle(Arc::clone(block)))
    }

    /// 归还一份持有；若这是最后一份，块立即回到池中或被释放，并返回 `true`。
    pub fn dec_ref_and_maybe_free(handle: BlockHandle) -> bool {
        Arc::into_inner(handle.0).is_some()
    }

    /// 交出当前块的隐式持有而不改动计数，分配器回到未持有状态。
    pub fn detach(&mut self) -> Option<BlockHandle> {
        let block = self.current.take()?;
        self.stats.blocks_detached += 1;
        self.region = 0;
        self.rewind();
        Some(BlockHandle(block))
    }

    /// 放弃分配器对当前块的隐式持有。
    pub fn deallocate(&mut self) {
        self.current = None;
        self.region = 0;
        self.rewind();
    }

    pub fn stats(&self) -> AllocatorStats {
        self.stats
    }
}

impl std::fmt::Debug for ZeroCopyAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZeroCopyAllocator")
            .field("pooled", &matches!(self.source, BlockSource::Pool(_)))
            .field("max_slots", &self.max_slots)
            .field("region", &self.region)
            .field("size", &self.size)
            .field("slot_cursor", &self.slot_cursor)
            .field("sealed", &self.sealed)
            .finish()
    }
}
