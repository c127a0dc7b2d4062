//! 缓冲池与共享分配器的配置模型。
//!
//! # 设计概要（How）
//! - 配置项以 `serde` 反序列化，可直接嵌入上层 TOML 文件的某个表；
//! - 每个结构都提供 `Default`（与历史部署保持一致的缺省值）与 `validate`，
//!   在构造阶段拒绝会导致运行期断言失败的组合。

use serde::Deserialize;

use crate::error::BufferError;

/// 缓冲池缺省尺寸类别（字节）。
pub const DEFAULT_POOL_BUFFER_SIZE: usize = 350_000;

/// 缓冲池缺省预留条目数。
pub const DEFAULT_EXPECTED_COUNT: usize = 16;

/// 分配器直接从堆上分配时的缺省接收区容量。
pub const DEFAULT_CAPACITY: usize = 8192;

/// [`BlockPool`](crate::BlockPool) 的配置。
///
/// - `buffer_size`：活动尺寸类别，即池中每个缓冲块的完整字节数；
/// - `expected_count`：为活动类别预留的条目数量，仅影响登记表的预分配。
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    pub buffer_size: usize,
    pub expected_count: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_POOL_BUFFER_SIZE,
            expected_count: DEFAULT_EXPECTED_COUNT,
        }
    }
}

impl PoolConfig {
    /// 从 TOML 文本解析池配置并执行校验。
    pub fn from_toml_str(text: &str) -> Result<Self, BufferError> {
        let config: Self =
            toml::from_str(text).map_err(|err| BufferError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// 尺寸类别不得为 0：零长度块没有独立地址，无法在池中反查。
    pub fn validate(&self) -> Result<(), BufferError> {
        if self.buffer_size == 0 {
            return Err(BufferError::InvalidSize {
                size: 0,
                reason: "pool size class must be non-zero",
            });
        }
        Ok(())
    }
}

/// [`ZeroCopyAllocator`](crate::ZeroCopyAllocator) 的配置。
///
/// # 契约说明（What）
/// - `capacity`：堆分配模式下的接收区容量；池化模式下由池的尺寸类别决定实际容量；
/// - `max_slots`：每个缓冲块可切分的消息视图数量，`None` 时按
///   `capacity / INLINE_MESSAGE_THRESHOLD` 向上取整推导；池化模式下必须显式给出，
///   否则同样按 `capacity` 推导；
/// - `use_pool`：是否从注入的 [`BlockPool`](crate::BlockPool) 获取缓冲块。
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AllocatorConfig {
    pub capacity: usize,
    pub max_slots: Option<usize>,
    pub use_pool: bool,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            max_slots: None,
            use_pool: false,
        }
    }
}

impl AllocatorConfig {
    /// 从 TOML 文本解析分配器配置并执行校验。
    pub fn from_toml_str(text: &str) -> Result<Self, BufferError> {
        let config: Self =
            toml::from_str(text).map_err(|err| BufferError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// 校验容量与槽位数量。
    pub fn validate(&self) -> Result<(), BufferError> {
        if self.capacity == 0 {
            return Err(BufferError::InvalidSize {
                size: 0,
                reason: "allocator capacity must be non-zero",
            });
        }
        if self.max_slots == Some(0) {
            return Err(BufferError::InvalidSize {
                size: 0,
                reason: "max_slots must be non-zero",
            });
        }
        Ok(())
    }
}
