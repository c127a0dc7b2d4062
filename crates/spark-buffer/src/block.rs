//! 引用计数共享缓冲块。
//!
//! # 设计概要（How）
//! - `SharedBlock` 以裸指针持有一整块堆内存，并记录它的来源（直接堆分配或 [`BlockPool`]）；
//! - 引用计数交给 `Arc<SharedBlock>`：分配器持有一份隐式引用，每个存活的消息视图各持有一份；
//! - 计数归零时 `Drop` 重建 `Box<[u8]>`，按来源归还池或直接释放，且只发生一次。
//!
//! # 并发契约（What）
//! - 块内的字节区间在同一时刻只有两类访问者：分配器（写，仅限封存水位之上的区间，
//!   或在它是唯一持有者时的整块），以及消息视图（读，仅限封存水位之下的区间）；
//! - 这一划分由 [`ZeroCopyAllocator`](crate::ZeroCopyAllocator) 维护，因此本模块的读写访问器都是 `unsafe`。

use std::{
    alloc::{Layout, handle_alloc_error},
    fmt,
    ops::Range,
    ptr::{self, NonNull},
    slice,
    sync::Arc,
};

use crate::pool::BlockPool;

/// 分配 `len` 字节的清零缓冲块。
///
/// 内存不足被视为进程级致命错误：先输出 `error!` 日志，再经 `handle_alloc_error` 终止进程。
pub fn alloc_block(len: usize) -> Box<[u8]> {
    let mut buf: Vec<u8> = Vec::new();
    if buf.try_reserve_exact(len).is_err() {
        tracing::error!(len, "out of memory while allocating a buffer block");
        match Layout::array::<u8>(len) {
            Ok(layout) => handle_alloc_error(layout),
            Err(_) => std::process::abort(),
        }
    }
    buf.resize(len, 0);
    buf.into_boxed_slice()
}

/// 缓冲块的来源，决定计数归零后的去向。
pub(crate) enum BlockOrigin {
    Heap,
    Pool(BlockPool),
}

pub(crate) struct SharedBlock {
    ptr: NonNull<u8>,
    len: usize,
    origin: BlockOrigin,
}

// SAFETY: `SharedBlock` 独占其指向的堆内存，等价于一个 `Box<[u8]>`；
// 跨线程的读写划分由持有者遵守模块级并发契约。
unsafe impl Send for SharedBlock {}
// SAFETY: 共享引用只暴露 `unsafe` 访问器，调用方负责保证区间不存在读写重叠。
unsafe impl Sync for SharedBlock {}

impl SharedBlock {
    pub(crate) fn new(block: Box<[u8]>, origin: BlockOrigin) -> Self {
        let len = block.len();
        let ptr = NonNull::from(Box::leak(block)).cast::<u8>();
        Self { ptr, len, origin }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// 只读访问 `range`。
    ///
    /// # Safety
    /// 调用期间及返回切片存活期间，不得有任何写者触及 `range`。
    pub(crate) unsafe fn slice(&self, range: Range<usize>) -> &[u8] {
        debug_assert!(range.start <= range.end && range.end <= self.len);
        // SAFETY: 区间位于块内；无写者由调用方保证。
        unsafe { slice::from_raw_parts(self.ptr.as_ptr().add(range.start), range.len()) }
    }

    /// 可写访问 `range`。
    ///
    /// # Safety
    /// 返回切片存活期间，调用方必须是 `range` 的唯一访问者。
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn slice_mut(&self, range: Range<usize>) -> &mut [u8] {
        debug_assert!(range.start <= range.end && range.end <= self.len);
        // SAFETY: 区间位于块内；独占访问由调用方保证。
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr().add(range.start), range.len()) }
    }
}

impl Drop for SharedBlock {
    fn drop(&mut self) {
        let raw = ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.len);
        // SAFETY: 指针与长度来自 `new` 中泄漏的 `Box<[u8]>`，且 `Drop` 只会执行一次。
        let block = unsafe { Box::from_raw(raw) };
        match &self.origin {
            BlockOrigin::Heap => drop(block),
            BlockOrigin::Pool(pool) => {
                pool.deallocate(block);
            }
        }
    }
}

/// 对共享缓冲块的一份持有。
///
/// 克隆即增加引用计数，析构即减少；最后一份持有消失时缓冲块回到池中或被释放。
/// 由 [`ZeroCopyAllocator::inc_ref`](crate::ZeroCopyAllocator::inc_ref)、
/// [`ZeroCopyAllocator::detach`](crate::ZeroCopyAllocator::detach) 以及消息视图提供。
#[derive(Clone)]
pub struct BlockHandle(pub(crate) Arc<SharedBlock>);

impl BlockHandle {
    /// 当前持有者数量（分配器的隐式持有 + 各消息视图 + 其它句柄）。
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// 两个句柄是否指向同一缓冲块。
    pub fn ptr_eq(&self, other: &BlockHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// 缓冲块首字节地址，仅用于身份比较与诊断。
    pub fn as_ptr(&self) -> *const u8 {
        self.0.as_ptr()
    }

    /// 缓冲块完整长度（含池化模式下为头部与槽位表预留的部分）。
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.len() == 0
    }

    /// 是否来自缓冲池。
    pub fn is_pooled(&self) -> bool {
        matches!(self.0.origin, BlockOrigin::Pool(_))
    }
}

impl fmt::Debug for BlockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockHandle")
            .field("ptr", &self.as_ptr())
            .field("len", &self.len())
            .field("ref_count", &self.ref_count())
            .field("pooled", &self.is_pooled())
            .finish()
    }
}
