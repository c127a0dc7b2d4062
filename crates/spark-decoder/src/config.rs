//! 解码器配置。
//!
//! 与 `spark-buffer` 的配置同构：`serde` 反序列化、`Default` 缺省值、构造前 `validate`。
//! 典型的 TOML 片段：
//!
//! ```toml
//! staging_capacity = 8192
//! max_slots = 64
//! use_memory_pool = true
//!
//! [pool]
//! buffer_size = 350000
//! expected_count = 16
//! ```

use serde::Deserialize;
use spark_buffer::{AllocatorConfig, DEFAULT_CAPACITY, PoolConfig};

use crate::error::DecodeError;

/// [`StreamDecoder`](crate::StreamDecoder) 的配置。
///
/// # 契约说明（What）
/// - `staging_capacity`：标准暂存容量，同时是堆分配模式下的缓冲块容量；
///   需求不小于它的字段走独立内存的零拷贝大消息路径；
/// - `max_slots`：每个缓冲块可切分的消息视图数，`None` 时按容量推导；
/// - `use_memory_pool`：是否从共享 [`BlockPool`](spark_buffer::BlockPool) 获取缓冲块；
/// - `pool`：未注入池时用来新建池的配置。
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DecoderConfig {
    pub staging_capacity: usize,
    pub max_slots: Option<usize>,
    pub use_memory_pool: bool,
    pub pool: PoolConfig,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            staging_capacity: DEFAULT_CAPACITY,
            max_slots: None,
            use_memory_pool: false,
            pool: PoolConfig::default(),
        }
    }
}

impl DecoderConfig {
    /// 从 TOML 文本解析并校验。
    pub fn from_toml_str(text: &str) -> Result<Self, DecodeError> {
        let config: Self =
            toml::from_str(text).map_err(|err| DecodeError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), DecodeError> {
        if self.staging_capacity == 0 {
            return Err(DecodeError::Config(
                "staging_capacity must be non-zero".to_owned(),
            ));
        }
        self.allocator_config().validate()?;
        if self.use_memory_pool {
            self.pool.validate()?;
        }
        Ok(())
    }

    /// 映射为分配器配置。
    pub fn allocator_config(&self) -> AllocatorConfig {
        AllocatorConfig {
            capacity: self.staging_capacity,
            max_slots: self.max_slots,
            use_pool: self.use_memory_pool,
        }
    }
}
