//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 集中定义缓冲池、共享分配器在运行期可能暴露的错误语义；
//! - 为上层解码器提供稳定的错误码，方便在日志与连接关闭原因中检索。
//!
//! ## 设计要求（What）
//! - 所有错误派生 `thiserror::Error`，满足 `Send + Sync + 'static`；
//! - 错误码遵循 `<领域>.<语义>` 命名约定，与 `codes` 模块中的常量一一对应；
//! - 内存分配失败**不**出现在这里：分配失败被视为进程级致命错误，直接终止进程。

use thiserror::Error;

/// 稳定错误码集合。
///
/// 错误码用于跨组件日志检索与告警聚合，一经发布不得修改字面值。
pub mod codes {
    /// 池中缓冲块容纳不下引用计数头与消息视图槽位表。
    pub const BUFFER_BLOCK_TOO_SMALL: &str = "buffer.block_too_small";
    /// 尺寸参数非法（例如为 0）。
    pub const BUFFER_INVALID_SIZE: &str = "buffer.invalid_size";
    /// 当前未持有任何缓冲块。
    pub const BUFFER_NO_BLOCK: &str = "buffer.no_block";
    /// 请求的区间越过了声明的可用范围。
    pub const BUFFER_OUT_OF_RANGE: &str = "buffer.out_of_range";
    /// 试图写入已被消息视图封存的区域。
    pub const BUFFER_SEALED_REGION: &str = "buffer.sealed_region";
    /// 消息视图槽位已耗尽却仍尝试切分视图。
    pub const BUFFER_SLOTS_EXHAUSTED: &str = "buffer.slots_exhausted";
    /// 配置解析或校验失败。
    pub const BUFFER_CONFIG: &str = "buffer.config";
}

/// 缓冲层错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：分配器与缓冲池的大部分失败都源于参数或调用顺序错误，
///   以细粒度枚举暴露可以让解码器直接映射为连接级的诊断原因。
/// - **契约 (What)**：
///   - 所有变体携带足以排障的数值上下文；
///   - [`BufferError::code`] 返回稳定错误码；
///   - 槽位耗尽在 [`advance_content`](crate::ZeroCopyAllocator::advance_content) 中是
///     计划内的轮换而非错误，只有绕过轮换直接切分视图才会得到 `SlotsExhausted`。
/// - **设计权衡 (Trade-offs)**：配置错误以字符串保存 `toml` 的诊断文本，
///   避免把解析器的错误类型泄露到公开 API。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BufferError {
    /// 池返回的缓冲块放不下头部与槽位表。
    #[error("pool block of {block} bytes cannot hold {required} bytes of header and slot table")]
    BlockTooSmall { block: usize, required: usize },

    /// 尺寸参数非法。
    #[error("invalid buffer size {size}: {reason}")]
    InvalidSize { size: usize, reason: &'static str },

    /// 当前未持有缓冲块。
    #[error("allocator holds no block; call allocate() first")]
    NoBlock,

    /// 区间越界。
    #[error("range {start}..{end} exceeds usable size {size}")]
    OutOfRange {
        start: usize,
        end: usize,
        size: usize,
    },

    /// 写入位置落在已封存区域内。
    #[error("offset {offset} lies below the sealed watermark {sealed}")]
    SealedRegion { offset: usize, sealed: usize },

    /// 槽位耗尽。
    #[error("all {max_slots} message-view slots of the current block are in use")]
    SlotsExhausted { max_slots: usize },

    /// 配置无效。
    #[error("invalid buffer configuration: {0}")]
    Config(String),
}

impl BufferError {
    /// 返回稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            BufferError::BlockTooSmall { .. } => codes::BUFFER_BLOCK_TOO_SMALL,
            BufferError::InvalidSize { .. } => codes::BUFFER_INVALID_SIZE,
            BufferError::NoBlock => codes::BUFFER_NO_BLOCK,
            BufferError::OutOfRange { .. } => codes::BUFFER_OUT_OF_RANGE,
            BufferError::SealedRegion { .. } => codes::BUFFER_SEALED_REGION,
            BufferError::SlotsExhausted { .. } => codes::BUFFER_SLOTS_EXHAUSTED,
            BufferError::Config(_) => codes::BUFFER_CONFIG,
        }
    }
}
