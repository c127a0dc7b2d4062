//! `spark-decoder` 实现接收侧的流式解码状态机。
//!
//! # 模块定位（Why）
//! - 传输层交付的字节流被任意切分，解码器需要跨读边界恢复帧结构；
//! - 较小的消息应直接指向接收缓冲，较大的消息应让传输层直接读进最终内存，
//!   两条路径都尽量避免复制。
//!
//! # 设计概要（How）
//! - [`Protocol`] 以一组 [`Step`] 函数描述帧结构，引擎只关心“收齐多少字节、落在哪里、接着调用谁”；
//! - [`StreamDecoder`] 提供三个入口：借出内存的 [`get_buffer`](StreamDecoder::get_buffer) /
//!   [`decode_filled`](StreamDecoder::decode_filled)，以及复制路径 [`decode`](StreamDecoder::decode)；
//! - 缓冲块的引用计数、复用与轮换由 `spark-buffer` 的 [`ZeroCopyAllocator`](spark_buffer::ZeroCopyAllocator) 负责。
//!
//! # 命名约定（Consistency）
//! - “暂存块”指分配器当前持有的接收缓冲块，“携带字节”指已在暂存块中、因让步尚未消费的字节；
//! - 错误码位于 [`codes`]，协议违例统一为 `protocol.decode`。

mod config;
mod cursor;
mod decoder;
mod engine;
mod error;
mod step;

pub use config::DecoderConfig;
pub use decoder::{DecodeProgress, DecodeStatus, Leftover, StreamDecoder};
pub use engine::DecoderStats;
pub use error::{DecodeError, DecodeFailure, codes};
pub use step::{FieldTarget, Protocol, Step, StepContext, StepOutcome};

pub use spark_buffer::{BlockPool, MessageView, ZeroCopyAllocator};
