//! 测试用帧格式：仿照常见消息传输的长度前缀帧。
//!
//! ```text
//! flags(1) | size(1 或 8，大端) | body(size)
//! flags: 0x01 = 后续还有帧，0x02 = 8 字节长度，其余位保留且必须为 0
//! ```
//!
//! 帧体使用原地落点，由步骤切分为消息视图；超过标准暂存容量的帧体自动走独立内存。
#![allow(dead_code)]

use spark_decoder::{
    DecodeError, DecodeProgress, DecodeStatus, FieldTarget, MessageView, Protocol, StepContext,
    StepOutcome, StreamDecoder,
};

pub const MORE: u8 = 0x01;
pub const LONG: u8 = 0x02;

#[derive(Debug, Clone)]
pub struct Frame {
    pub more: bool,
    pub body: MessageView,
}

#[derive(Debug, Default)]
pub struct Framing {
    pub frames: Vec<Frame>,
    pub yield_after_frame: bool,
    pub max_body: Option<u64>,
    pub(crate) more: bool,
}

impl Framing {
    pub fn yielding() -> Self {
        Self {
            yield_after_frame: true,
            ..Self::default()
        }
    }

    pub fn bodies(&self) -> Vec<Vec<u8>> {
        self.frames.iter().map(|frame| frame.body.to_vec()).collect()
    }

    fn flags_ready(&mut self, ctx: &mut StepContext<'_, Self>) -> Result<StepOutcome, DecodeError> {
        let flags = ctx
            .field()
            .first()
            .copied()
            .ok_or_else(|| DecodeError::protocol("missing flags byte"))?;
        if flags & !(MORE | LONG) != 0 {
            return Err(DecodeError::protocol("reserved flag bits set"));
        }
        self.more = flags & MORE != 0;
        let size_len = if flags & LONG != 0 { 8 } else { 1 };
        ctx.next_step(FieldTarget::InPlace, size_len, Self::size_ready);
        Ok(StepOutcome::Continue)
    }

    fn size_ready(&mut self, ctx: &mut StepContext<'_, Self>) -> Result<StepOutcome, DecodeError> {
        let field = ctx.field();
        let size = match field.len() {
            1 => u64::from(field[0]),
            8 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(field);
                u64::from_be_bytes(raw)
            }
            other => {
                return Err(DecodeError::protocol(format!(
                    "unexpected size field of {other} bytes"
                )));
            }
        };
        if self.max_body.is_some_and(|max| size > max) {
            return Err(DecodeError::protocol("frame body exceeds limit"));
        }
        let size = usize::try_from(size).map_err(|_| DecodeError::protocol("frame too large"))?;
        ctx.next_step(FieldTarget::InPlace, size, Self::body_ready);
        Ok(StepOutcome::Continue)
    }

    fn body_ready(&mut self, ctx: &mut StepContext<'_, Self>) -> Result<StepOutcome, DecodeError> {
        let body = ctx.carve()?;
        self.frames.push(Frame {
            more: self.more,
            body,
        });
        ctx.next_step(FieldTarget::InPlace, 1, Self::flags_ready);
        if self.yield_after_frame {
            Ok(StepOutcome::Yield)
        } else {
            Ok(StepOutcome::Continue)
        }
    }
}

impl Protocol for Framing {
    fn start(&mut self, ctx: &mut StepContext<'_, Self>) {
        ctx.next_step(FieldTarget::InPlace, 1, Self::flags_ready);
    }
}

/// 编码一组帧；长度超过 255 的帧体使用 8 字节长度。
pub fn encode_frames(bodies: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    for (index, body) in bodies.iter().enumerate() {
        let more = if index + 1 < bodies.len() { MORE } else { 0 };
        if body.len() > u8::MAX as usize {
            out.push(more | LONG);
            out.extend_from_slice(&(body.len() as u64).to_be_bytes());
        } else {
            out.push(more);
            out.push(body.len() as u8);
        }
        out.extend_from_slice(body);
    }
    out
}

/// 复制路径：按给定分块依次调用 `decode`。
pub fn feed_copied(decoder: &mut StreamDecoder<Framing>, stream: &[u8], chunks: &[usize]) {
    let mut offset = 0;
    let mut sizes = chunks.iter().copied().cycle();
    while offset < stream.len() {
        let n = sizes.next().unwrap_or(1).max(1).min(stream.len() - offset);
        let progress = decoder.decode(&stream[offset..offset + n]).expect("复制路径解码");
        assert_eq!(progress.status, DecodeStatus::NeedMore);
        assert_eq!(progress.consumed, n);
        offset += n;
    }
}

/// 借出路径：每次写入 `min(借出长度, 分块, 剩余)` 字节后调用 `decode_filled`。
pub fn feed_lent(decoder: &mut StreamDecoder<Framing>, stream: &[u8], chunks: &[usize]) {
    let mut offset = 0;
    let mut sizes = chunks.iter().copied().cycle();
    while offset < stream.len() {
        let want = sizes.next().unwrap_or(1).max(1);
        let buf = decoder.get_buffer().expect("借出内存");
        assert!(!buf.is_empty(), "没有携带字节时借出区不得为空");
        let n = want.min(buf.len()).min(stream.len() - offset);
        buf[..n].copy_from_slice(&stream[offset..offset + n]);
        let progress: DecodeProgress = decoder.decode_filled(n).expect("借出路径解码");
        assert_eq!(progress.status, DecodeStatus::NeedMore);
        offset += n;
    }
}

/// 生成测试帧体：长度按给定序列，内容由序号派生便于定位差异。
pub fn bodies_with_lengths(lengths: &[usize]) -> Vec<Vec<u8>> {
    lengths
        .iter()
        .enumerate()
        .map(|(index, &len)| (0..len).map(|i| (index * 31 + i) as u8).collect())
        .collect()
}
