//! `spark-buffer` 提供零拷贝接收路径所需的缓冲层：共享缓冲池、引用计数缓冲块、
//! 零拷贝分配器与消息视图。
//!
//! # 模块定位（Why）
//! - 解码器需要把传输层读入的字节直接切分成消息，而不是逐条复制；
//! - 缓冲块在多个消息视图、多个线程之间共享，必须恰好在最后一份持有消失时回收。
//!
//! # 设计概要（How）
//! - `pool` 模块实现 [`BlockPool`]：按尺寸类别登记缓冲块，跨解码器、跨线程复用；
//! - `block` 模块以 `Arc` 承载缓冲块的引用计数，计数归零时把内存交还池或直接释放；
//! - `allocator` 模块实现 [`ZeroCopyAllocator`]：维护接收区、槽位表与封存水位，
//!   在槽位耗尽时轮换缓冲块；
//! - `view` 模块实现 [`MessageView`]：指向缓冲块内部或独立持有字节的只读消息。
//!
//! # 命名约定（Consistency）
//! - “块”（block）指一整块池化或堆分配内存，“接收区”（region）指其中可写入网络字节的部分；
//! - 错误码统一位于 [`codes`]，遵循 `buffer.<语义>` 格式。

mod allocator;
mod block;
mod config;
mod error;
mod pool;
mod view;

pub use allocator::{
    AllocatorStats, HEADER_FOOTPRINT, INLINE_MESSAGE_THRESHOLD, SLOT_FOOTPRINT, SlotDescriptor,
    ZeroCopyAllocator,
};
pub use block::{BlockHandle, alloc_block};
pub use config::{
    AllocatorConfig, DEFAULT_CAPACITY, DEFAULT_EXPECTED_COUNT, DEFAULT_POOL_BUFFER_SIZE, PoolConfig,
};
pub use error::{BufferError, codes};
pub use pool::{BlockPool, PoolStats};
pub use view::MessageView;
