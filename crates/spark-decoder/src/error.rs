//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 区分三类失败：协议违例（字节流本身不合法）、调用方误用（调用顺序错误）、
//!   缓冲层故障（来自 `spark-buffer`）；
//! - 为连接关闭原因与日志提供稳定错误码。
//!
//! ## 设计要求（What）
//! - 致命错误会使解码器进入中毒状态，之后的每次调用都返回 [`DecodeError::Poisoned`]；
//! - 误用类错误（[`DecodeError::NothingLent`]、[`DecodeError::FillOverrun`]）不改变解码状态；
//! - 让步（yield）与槽位轮换都不是错误。

use std::borrow::Cow;

use spark_buffer::BufferError;
use thiserror::Error;

/// 稳定错误码集合。
pub mod codes {
    /// 协议层判定字节流非法。
    pub const PROTOCOL_DECODE: &str = "protocol.decode";
    /// 步骤执行完毕却没有安排后继步骤。
    pub const DECODER_STEP_NOT_SCHEDULED: &str = "decoder.step_not_scheduled";
    /// 解码器已因先前的致命错误中毒。
    pub const DECODER_POISONED: &str = "decoder.poisoned";
    /// 回填字节数超过借出的区间。
    pub const DECODER_FILL_OVERRUN: &str = "decoder.fill_overrun";
    /// 未借出区间却调用了原地解码。
    pub const DECODER_NOTHING_LENT: &str = "decoder.nothing_lent";
    /// 解码器配置无效。
    pub const DECODER_CONFIG: &str = "decoder.config";
}

/// 解码错误域。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum DecodeError {
    /// 协议违例，由步骤函数报告。
    #[error("protocol violation: {reason}")]
    Protocol { reason: Cow<'static, str> },

    /// 步骤没有调用 `next_step`。
    #[error("step returned without scheduling a successor")]
    StepNotScheduled,

    /// 解码器已中毒。
    #[error("decoder is poisoned by an earlier fatal failure")]
    Poisoned,

    /// 回填越界。
    #[error("filled {filled} bytes but only {lent} were lent")]
    FillOverrun { filled: usize, lent: usize },

    /// 没有借出的区间。
    #[error("decode_filled called without a region lent by get_buffer")]
    NothingLent,

    /// 缓冲层故障。
    #[error(transparent)]
    Buffer(#[from] BufferError),

    /// 配置无效。
    #[error("invalid decoder configuration: {0}")]
    Config(String),
}

impl DecodeError {
    /// 构造协议违例。
    pub fn protocol(reason: impl Into<Cow<'static, str>>) -> Self {
        DecodeError::Protocol {
            reason: reason.into(),
        }
    }

    /// 返回稳定错误码；缓冲层故障沿用 `spark-buffer` 的错误码。
    pub fn code(&self) -> &'static str {
        match self {
            DecodeError::Protocol { .. } => codes::PROTOCOL_DECODE,
            DecodeError::StepNotScheduled => codes::DECODER_STEP_NOT_SCHEDULED,
            DecodeError::Poisoned => codes::DECODER_POISONED,
            DecodeError::FillOverrun { .. } => codes::DECODER_FILL_OVERRUN,
            DecodeError::NothingLent => codes::DECODER_NOTHING_LENT,
            DecodeError::Buffer(err) => err.code(),
            DecodeError::Config(_) => codes::DECODER_CONFIG,
        }
    }

    /// 是否为调用方误用（不会使解码器中毒）。
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            DecodeError::NothingLent | DecodeError::FillOverrun { .. } | DecodeError::Poisoned
        )
    }
}

/// 一次解码调用的失败结果。
///
/// `consumed` 只统计故障发生前已经处理的字节，调用方据此判断连接在何处出错。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("decoding failed after {consumed} bytes: {error}")]
pub struct DecodeFailure {
    pub consumed: usize,
    #[source]
    pub error: DecodeError,
}

impl DecodeFailure {
    pub fn code(&self) -> &'static str {
        self.error.code()
    }
}
