use spark_buffer::{BlockPool, ZeroCopyAllocator};

use crate::{
    config::DecoderConfig,
    engine::{DecoderStats, Engine},
    error::{DecodeError, DecodeFailure},
    step::Protocol,
};

/// 一次成功解码调用的结果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeProgress {
    /// 本次调用视为已消费的字节数。
    ///
    /// 对 `decode_filled` 与 `decode` 而言包括先前携带的字节；发生让步时等于全部输入。
    pub consumed: usize,
    pub status: DecodeStatus,
}

/// 解码调用结束时的状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStatus {
    /// 输入已全部处理，等待更多字节。
    NeedMore,
    /// 某个步骤请求让步，本次调用提前返回。
    Yielded(Leftover),
}

/// 让步时尚未解码的字节。
///
/// - `retained`：已在暂存区、由解码器保留的字节，下一次 `decode_filled`、`decode`
///   或 [`StreamDecoder::resume`] 会先处理它们；
/// - `resubmit`：`decode` 输入末尾未被触及的字节数，调用方需要在稍后重新提交
///   `data[data.len() - resubmit..]`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Leftover {
    pub retained: usize,
    pub resubmit: usize,
}

/// `StreamDecoder` 把任意切分的字节流还原为离散消息。
///
/// # 模块角色（Why）
/// - 传输层按自己的节奏读取字节，帧边界与读边界毫无关系；
///   解码器在任意位置暂停，并在下一批字节到达时从断点继续；
/// - 帧结构由 [`Protocol`] 的步骤描述，引擎只负责“收齐 N 字节后调用某个步骤”。
///
/// # 核心机制（How）
/// - **零拷贝路径**：[`get_buffer`](Self::get_buffer) 借出暂存块的一段空闲区，传输层直接读入，
///   [`decode_filled`](Self::decode_filled) 原地推进游标；原地字段由步骤切分为指向暂存块的视图；
/// - **大消息路径**：字段需要不少于标准暂存容量的字节时，`get_buffer` 直接借出该字段的独立内存；
/// - **复制路径**：[`decode`](Self::decode) 接受位于任意位置的字节，复制到字段落点；
/// - 暂存块的复用、更换与轮换交给 [`ZeroCopyAllocator`]。
///
/// # 契约说明（What）
/// - 分块方式不影响结果：同一字节流无论如何切分，产出的消息序列相同；
/// - 致命错误同步返回并使解码器中毒，之后的调用返回 [`DecodeError::Poisoned`]；
/// - 步骤请求让步时，调用立即成功返回，未处理的字节见 [`Leftover`]。
///
/// # 设计权衡（Trade-offs）
/// - 每次 `get_buffer` 都按 `allocate` 语义准备暂存块：仍有视图引用旧块时会换新块，
///   以内存换取“视图永不被覆写”的保证。
pub struct StreamDecoder<P: Protocol> {
    protocol: P,
    engine: Engine<P>,
}

impl<P: Protocol> StreamDecoder<P> {
    /// 以现成的分配器构造，标准暂存容量取暂存块的完整接收区。
    pub fn new(protocol: P, mut allocator: ZeroCopyAllocator) -> Result<Self, DecodeError> {
        if !allocator.has_block() {
            allocator.allocate()?;
        }
        let standard = allocator.capacity();
        Self::assemble(protocol, allocator, standard)
    }

    /// 按配置构造。启用内存池而未注入池时，按 `config.pool` 新建一个。
    pub fn from_config(
        protocol: P,
        config: &DecoderConfig,
        pool: Option<BlockPool>,
    ) -> Result<Self, DecodeError> {
        config.validate()?;
        let pool = match (config.use_memory_pool, pool) {
            (true, Some(pool)) => Some(pool),
            (true, None) => Some(BlockPool::with_config(&config.pool)?),
            (false, _) => None,
        };
        let mut allocator = ZeroCopyAllocator::from_config(&config.allocator_config(), pool)?;
        allocator.allocate()?;
        let standard = config.staging_capacity.min(allocator.capacity());
        Self::assemble(protocol, allocator, standard)
    }

    fn assemble(
        mut protocol: P,
        allocator: ZeroCopyAllocator,
        standard: usize,
    ) -> Result<Self, DecodeError> {
        let mut engine = Engine::new(allocator, standard);
        engine.start(&mut protocol)?;
        Ok(Self { protocol, engine })
    }

    /// 借出一段可写内存供传输层直接读入。
    ///
    /// 携带字节恰好占满暂存块时返回的切片可能为空，此时应先调用 [`resume`](Self::resume)。
    pub fn get_buffer(&mut self) -> Result<&mut [u8], DecodeError> {
        self.engine.get_buffer()
    }

    /// 确认传输层向 [`get_buffer`](Self::get_buffer) 借出的内存写入了 `filled` 字节，并原地解码。
    pub fn decode_filled(&mut self, filled: usize) -> Result<DecodeProgress, DecodeFailure> {
        let (consumed, yielded) = self.engine.decode_filled(&mut self.protocol, filled)?;
        Ok(self.progress(consumed, yielded.then_some(0)))
    }

    /// 解码位于任意位置的字节（复制路径）。
    pub fn decode(&mut self, data: &[u8]) -> Result<DecodeProgress, DecodeFailure> {
        let (consumed, resubmit) = self.engine.decode(&mut self.protocol, data)?;
        Ok(self.progress(consumed, resubmit))
    }

    /// 处理让步后保留的字节。
    pub fn resume(&mut self) -> Result<DecodeProgress, DecodeFailure> {
        let (consumed, yielded) = self.engine.resume(&mut self.protocol)?;
        Ok(self.progress(consumed, yielded.then_some(0)))
    }

    fn progress(&self, consumed: usize, resubmit: Option<usize>) -> DecodeProgress {
        let status = match resubmit {
            Some(resubmit) => DecodeStatus::Yielded(Leftover {
                retained: self.engine.carried(),
                resubmit,
            }),
            None => DecodeStatus::NeedMore,
        };
        DecodeProgress { consumed, status }
    }

    /// 调整标准暂存容量；暂存块的声明尺寸随之变为 `新容量 + 携带字节`。
    pub fn resize_buffer(&mut self, size: usize) -> Result<(), DecodeError> {
        self.engine.apply_resize(size)
    }

    pub fn protocol(&self) -> &P {
        &self.protocol
    }

    pub fn protocol_mut(&mut self) -> &mut P {
        &mut self.protocol
    }

    pub fn into_protocol(self) -> P {
        self.protocol
    }

    pub fn allocator(&self) -> &ZeroCopyAllocator {
        self.engine.allocator()
    }

    pub fn stats(&self) -> DecoderStats {
        self.engine.stats()
    }

    pub fn is_poisoned(&self) -> bool {
        self.engine.is_poisoned()
    }

    /// 已在暂存区、尚未消费的字节数。
    pub fn carried(&self) -> usize {
        self.engine.carried()
    }

    /// 当前标准暂存容量。
    pub fn staging_capacity(&self) -> usize {
        self.engine.standard()
    }
}

impl<P: Protocol + std::fmt::Debug> std::fmt::Debug for StreamDecoder<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamDecoder")
            .field("protocol", &self.protocol)
            .field("allocator", self.engine.allocator())
            .field("carried", &self.engine.carried())
            .field("poisoned", &self.engine.is_poisoned())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::{FieldTarget, StepContext, StepOutcome};
    use tracing_test::traced_test;

    /// 两字节定长记录，首字节必须为 0x7F。
    #[derive(Debug, Default)]
    struct Records {
        seen: Vec<[u8; 2]>,
    }

    impl Records {
        fn record(&mut self, ctx: &mut StepContext<'_, Self>) -> Result<StepOutcome, DecodeError> {
            let field = ctx.field();
            if field.first() != Some(&0x7F) {
                return Err(DecodeError::protocol("bad record marker"));
            }
            self.seen.push([field[0], field[1]]);
            ctx.next_step(FieldTarget::InPlace, 2, Self::record);
            Ok(StepOutcome::Continue)
        }
    }

    impl Protocol for Records {
        fn start(&mut self, ctx: &mut StepContext<'_, Self>) {
            ctx.next_step(FieldTarget::InPlace, 2, Self::record);
        }
    }

    fn records() -> StreamDecoder<Records> {
        let allocator = ZeroCopyAllocator::new(16).expect("构造分配器");
        StreamDecoder::new(Records::default(), allocator).expect("构造解码器")
    }

    #[test]
    fn odd_chunks_resume_mid_field() {
        let mut decoder = records();
        for chunk in [&[0x7F][..], &[1, 0x7F, 2, 0x7F][..], &[3][..]] {
            let progress = decoder.decode(chunk).expect("解码");
            assert_eq!(progress.status, DecodeStatus::NeedMore);
            assert_eq!(progress.consumed, chunk.len());
        }
        assert_eq!(decoder.protocol().seen, vec![[0x7F, 1], [0x7F, 2], [0x7F, 3]]);
        assert_eq!(decoder.stats().steps_fired, 3);
    }

    #[test]
    fn staging_window_wraps_to_block_start() {
        let mut decoder = records();
        for round in 0..20u8 {
            let buf = decoder.get_buffer().expect("借出内存");
            assert!(!buf.is_empty());
            buf[0] = 0x7F;
            decoder.decode_filled(1).expect("回填首字节");
            let buf = decoder.get_buffer().expect("借出内存");
            buf[0] = round;
            decoder.decode_filled(1).expect("回填次字节");
        }
        assert_eq!(decoder.protocol().seen.len(), 20);
        assert!(decoder.allocator().size() <= 16);
        assert_eq!(decoder.stats().bytes_copied, 0);
    }

    #[test]
    fn unbounded_staging_capacity_mid_field_keeps_decoding() {
        let mut decoder = records();
        decoder.decode(&[0x7F]).expect("写入半个字段");

        decoder.resize_buffer(usize::MAX).expect("调整标准容量");
        assert_eq!(decoder.staging_capacity(), usize::MAX);
        assert!(decoder.allocator().size() <= 16, "声明尺寸受物理容量约束");

        decoder.decode(&[1, 0x7F]).expect("复制路径继续解码");
        let buf = decoder.get_buffer().expect("借出内存");
        assert!(!buf.is_empty());
        buf[0] = 2;
        let progress = decoder.decode_filled(1).expect("借出路径继续解码");
        assert_eq!(progress.status, DecodeStatus::NeedMore);
        assert_eq!(decoder.protocol().seen, vec![[0x7F, 1], [0x7F, 2]]);
        assert!(!decoder.is_poisoned());
    }

    #[test]
    #[traced_test]
    fn fatal_failure_is_logged_once_and_poisons() {
        let mut decoder = records();
        let failure = decoder.decode(&[0x7F, 0, 0x00, 0]).unwrap_err();
        assert_eq!(failure.consumed, 4);
        assert_eq!(failure.code(), crate::codes::PROTOCOL_DECODE);
        assert!(logs_contain("decoder poisoned by a fatal failure"));

        let again = decoder.decode(&[0x7F, 0]).unwrap_err();
        assert_eq!(again.error, DecodeError::Poisoned);
        assert_eq!(decoder.protocol().seen.len(), 1);
    }
}
