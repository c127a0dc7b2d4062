use std::{mem, ops::Range};

use spark_buffer::{BufferError, MessageView, ZeroCopyAllocator, alloc_block};
use tracing::{debug, trace, warn};

use crate::{
    cursor::{Completed, Cursor, Lent, Target},
    error::{DecodeError, DecodeFailure},
    step::{FieldTarget, Protocol, Step, StepContext, StepOutcome},
};

/// 解码器计数。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DecoderStats {
    /// 已执行的步骤数。
    pub steps_fired: u64,
    /// 由传输层直接写到最终位置、无需复制的字节数。
    pub bytes_in_place: u64,
    /// 从输入或暂存区复制到字段落点的字节数。
    pub bytes_copied: u64,
    /// 为腾出空间而搬移到暂存块开头的字节数（含轮换携带的尾部）。
    pub bytes_relocated: u64,
    /// 搬移次数。
    pub relocations: u64,
    /// 槽位耗尽导致的缓冲块轮换次数。
    pub rotations: u64,
}

/// 解码状态机本体。
///
/// 暂存区布局（偏移均相对当前暂存块的接收区）：
///
/// ```text
/// 0 ........ sealed ........ head ......... head + carry ......... size
/// |  已切分视图  |  已消费的字段字节 |  已到达未消费字节  |  可借出的空闲区  |
/// ```
///
/// - `head` 是逻辑游标：下一个待消费字节所在位置；
/// - `carry` 是已在暂存区、但因让步而尚未消费的字节数；
/// - 原地字段 `[start, start + len)` 始终完整落在 `size` 之内。
pub(crate) struct Engine<P> {
    alloc: ZeroCopyAllocator,
    cursor: Cursor<P>,
    head: usize,
    carry: usize,
    standard: usize,
    lent: Option<Lent>,
    poisoned: bool,
    stats: DecoderStats,
}

impl<P> Engine<P> {
    pub(crate) fn new(alloc: ZeroCopyAllocator, standard: usize) -> Self {
        Self {
            alloc,
            cursor: Cursor::idle(),
            head: 0,
            carry: 0,
            standard: standard.max(1),
            lent: None,
            poisoned: false,
            stats: DecoderStats::default(),
        }
    }

    pub(crate) fn allocator(&self) -> &ZeroCopyAllocator {
        &self.alloc
    }

    pub(crate) fn head(&self) -> usize {
        self.head
    }

    pub(crate) fn carried(&self) -> usize {
        self.carry
    }

    pub(crate) fn standard(&self) -> usize {
        self.standard
    }

    pub(crate) fn stats(&self) -> DecoderStats {
        self.stats
    }

    pub(crate) fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    pub(crate) fn schedule(&mut self, target: FieldTarget, len: usize, step: Step<P>) {
        let target = match target {
            _ if len == 0 => Target::Vacant,
            FieldTarget::InPlace if len <= self.standard => Target::Staged { start: self.head },
            // 独立内存会整段借给传输层写入，借出前必须清零初始化。
            FieldTarget::InPlace | FieldTarget::Owned => Target::Owned {
                buf: alloc_block(len).into_vec(),
                filled: 0,
            },
        };
        self.cursor = Cursor {
            target,
            len,
            remaining: len,
            step: Some(step),
        };
    }

    pub(crate) fn resize_buffer(&mut self, size: usize) {
        self.standard = size.max(1);
        self.lent = None;
        if self.alloc.has_block() {
            self.alloc.resize(self.declared_size());
        }
    }

    /// 声明尺寸：已到达字节之后再留出一个标准容量，超过物理容量时由分配器截断。
    fn declared_size(&self) -> usize {
        (self.head + self.carry).saturating_add(self.standard)
    }

    /// 切分刚收齐的原地字段，并在槽位耗尽时把游标迁到新暂存块。
    pub(crate) fn carve_staged(&mut self, range: Range<usize>) -> Result<MessageView, DecodeError> {
        let view = self.alloc.carve(range.clone())?;
        let declared = self.alloc.size();
        let live = self.head + self.carry;
        // 轮换只需携带真正到达的字节，借出区中未写入的部分不必复制。
        self.alloc.resize(live);
        if self.alloc.advance_content(range.end)? {
            self.alloc.resize(declared);
            return Ok(view);
        }

        let shift = range.end;
        self.head -= shift;
        if let Target::Staged { start } = &mut self.cursor.target {
            *start = start.saturating_sub(shift);
        }
        self.stats.rotations += 1;
        self.stats.bytes_relocated += (live - shift) as u64;
        self.alloc.resize(self.declared_size());
        debug!(
            carried = live - shift,
            slots = self.alloc.max_slots(),
            "staging block rotated after slot exhaustion"
        );
        Ok(view)
    }

    /// 把 `[keep_from, head + carry)` 搬到（复用或新取得的）暂存块开头。
    fn reposition(&mut self, keep_from: usize) -> Result<(), DecodeError> {
        let live = self.head + self.carry;
        let moved = live - keep_from;
        self.alloc.relocate(keep_from..live)?;
        self.head -= keep_from;
        if let Target::Staged { start } = &mut self.cursor.target {
            *start -= keep_from;
        }
        let needed = match self.cursor.target {
            Target::Staged { start } => start.saturating_add(self.cursor.len),
            Target::Owned { .. } | Target::Vacant => 0,
        };
        self.alloc.resize(self.declared_size().max(needed));
        if moved > 0 {
            self.stats.relocations += 1;
            self.stats.bytes_relocated += moved as u64;
            debug!(moved, "pending bytes moved to the front of the staging block");
        }
        Ok(())
    }

    /// 保证原地字段完整落在声明尺寸之内；暂存块实在放不下时改为独立内存。
    pub(crate) fn ensure_fits(&mut self) -> Result<(), DecodeError> {
        let Target::Staged { start } = self.cursor.target else {
            return Ok(());
        };
        if self.alloc.has_block() && start.saturating_add(self.cursor.len) <= self.alloc.size() {
            return Ok(());
        }
        self.reposition(start)?;
        if self.cursor.len <= self.alloc.size() {
            return Ok(());
        }

        let filled = self.cursor.filled();
        // 同 `schedule`：借出前必须初始化。
        let mut buf = alloc_block(self.cursor.len).into_vec();
        buf[..filled].copy_from_slice(&self.alloc.data()[..filled]);
        self.stats.bytes_copied += filled as u64;
        self.cursor.target = Target::Owned { buf, filled };
        debug!(
            len = self.cursor.len,
            region = self.alloc.capacity(),
            "in-place field exceeds the staging block, switched to owned storage"
        );
        Ok(())
    }

    fn fire(&mut self, protocol: &mut P) -> Result<StepOutcome, DecodeError> {
        let step = self.cursor.step.take().ok_or(DecodeError::StepNotScheduled)?;
        let completed = match mem::replace(&mut self.cursor.target, Target::Vacant) {
            Target::Staged { start } => Completed::Staged(start..start + self.cursor.len),
            Target::Owned { buf, .. } => Completed::Owned(buf),
            Target::Vacant => Completed::None,
        };

        let mut ctx = StepContext::new(self, completed);
        let outcome = step(protocol, &mut ctx)?;
        if !ctx.scheduled() {
            return Err(DecodeError::StepNotScheduled);
        }
        self.stats.steps_fired += 1;
        self.ensure_fits()?;
        if outcome == StepOutcome::Yield {
            trace!(carried = self.carry, "step yielded");
        }
        Ok(outcome)
    }

    /// 消费暂存区中 `[head, head + carry)` 的字节，直到耗尽或步骤让步。
    ///
    /// 原地字段的字节已经在目标位置，只推进游标；独立内存字段需要复制。
    /// 返回是否发生让步。
    fn drain(&mut self, protocol: &mut P, processed: &mut usize) -> Result<bool, DecodeError> {
        loop {
            if self.cursor.remaining == 0 {
                if self.fire(protocol)? == StepOutcome::Yield {
                    return Ok(true);
                }
                continue;
            }
            if self.carry == 0 {
                return Ok(false);
            }

            let n = self.cursor.remaining.min(self.carry);
            match &mut self.cursor.target {
                Target::Staged { .. } => self.stats.bytes_in_place += n as u64,
                Target::Owned { buf, filled } => {
                    let src = self
                        .alloc
                        .data()
                        .get(self.head..self.head + n)
                        .ok_or(BufferError::OutOfRange {
                            start: self.head,
                            end: self.head + n,
                            size: self.alloc.size(),
                        })?;
                    buf[*filled..*filled + n].copy_from_slice(src);
                    *filled += n;
                    self.stats.bytes_copied += n as u64;
                }
                Target::Vacant => {}
            }
            self.head += n;
            self.carry -= n;
            self.cursor.remaining -= n;
            *processed += n;
        }
    }

    /// 把外部输入复制到字段落点，直到输入耗尽或步骤让步。
    fn feed(
        &mut self,
        protocol: &mut P,
        data: &[u8],
        offset: &mut usize,
        processed: &mut usize,
    ) -> Result<bool, DecodeError> {
        loop {
            if self.cursor.remaining == 0 {
                if self.fire(protocol)? == StepOutcome::Yield {
                    return Ok(true);
                }
                continue;
            }
            if *offset == data.len() {
                return Ok(false);
            }

            let n = self.cursor.remaining.min(data.len() - *offset);
            let chunk = &data[*offset..*offset + n];
            match &mut self.cursor.target {
                Target::Staged { .. } => {
                    let size = self.alloc.size();
                    let dst = self
                        .alloc
                        .spare_mut(self.head)?
                        .get_mut(..n)
                        .ok_or(BufferError::OutOfRange {
                            start: self.head,
                            end: self.head + n,
                            size,
                        })?;
                    dst.copy_from_slice(chunk);
                    self.head += n;
                }
                Target::Owned { buf, filled } => {
                    buf[*filled..*filled + n].copy_from_slice(chunk);
                    *filled += n;
                }
                Target::Vacant => {}
            }
            self.stats.bytes_copied += n as u64;
            self.cursor.remaining -= n;
            *offset += n;
            *processed += n;
        }
    }

    fn fail(&mut self, consumed: usize, error: DecodeError) -> DecodeFailure {
        if !error.is_misuse() {
            self.poisoned = true;
            self.lent = None;
            warn!(
                code = error.code(),
                consumed,
                error = %error,
                "decoder poisoned by a fatal failure"
            );
        }
        DecodeFailure { consumed, error }
    }

    fn check_poison(&self) -> Result<(), DecodeFailure> {
        if self.poisoned {
            return Err(DecodeFailure {
                consumed: 0,
                error: DecodeError::Poisoned,
            });
        }
        Ok(())
    }
}

impl<P: Protocol> Engine<P> {
    pub(crate) fn start(&mut self, protocol: &mut P) -> Result<(), DecodeError> {
        let mut ctx = StepContext::new(self, Completed::None);
        protocol.start(&mut ctx);
        if !ctx.scheduled() {
            return Err(DecodeError::StepNotScheduled);
        }
        self.ensure_fits()
    }

    pub(crate) fn get_buffer(&mut self) -> Result<&mut [u8], DecodeError> {
        if self.poisoned {
            return Err(DecodeError::Poisoned);
        }
        self.lent = None;
        if let Err(err) = self.prepare_lend() {
            let failure = self.fail(0, err);
            return Err(failure.error);
        }
        match (self.lent, &mut self.cursor.target) {
            (Some(Lent::Owned { len }), Target::Owned { buf, filled }) => {
                Ok(&mut buf[*filled..*filled + len])
            }
            (Some(Lent::Staging { at, .. }), _) => Ok(self.alloc.spare_mut(at)?),
            _ => Ok(&mut []),
        }
    }

    /// 决定借出哪一段内存。
    ///
    /// 1. 有携带字节：紧随其后借出暂存区，携带字节抵达块尾时先搬到块开头；
    /// 2. 独立内存字段尚缺不少于标准容量的字节：直接借出该字段的剩余部分；
    /// 3. 其它情况：按 `allocate` 语义复用或更换暂存块，未收齐的原地字段搬到块开头，
    ///    借出紧随其后的区间。
    fn prepare_lend(&mut self) -> Result<(), DecodeError> {
        let large = self.carry == 0
            && matches!(self.cursor.target, Target::Owned { .. })
            && self.cursor.remaining >= self.standard;
        if large {
            let len = self.cursor.remaining;
            self.lent = Some(Lent::Owned { len });
            trace!(len, "lending field storage for a large message");
            return Ok(());
        }

        let keep_from = match self.cursor.target {
            Target::Staged { start } => start,
            Target::Owned { .. } | Target::Vacant => self.head,
        };
        let live = self.head + self.carry;
        if !self.alloc.has_block() || self.carry == 0 || live >= self.alloc.size() {
            self.reposition(keep_from)?;
        }
        let at = self.head + self.carry;
        let len = self.alloc.size().saturating_sub(at);
        self.lent = Some(Lent::Staging { at, len });
        trace!(at, len, "lending staging region");
        Ok(())
    }

    pub(crate) fn decode_filled(
        &mut self,
        protocol: &mut P,
        filled: usize,
    ) -> Result<(usize, bool), DecodeFailure> {
        self.check_poison()?;
        let Some(lent) = self.lent.take() else {
            return Err(self.fail(0, DecodeError::NothingLent));
        };
        let mut processed = 0;
        let prior = self.carry;
        match lent {
            Lent::Owned { len } => {
                if filled > len {
                    return Err(self.fail(0, DecodeError::FillOverrun { filled, lent: len }));
                }
                if let Target::Owned { filled: done, .. } = &mut self.cursor.target {
                    *done += filled;
                }
                self.cursor.remaining -= filled;
                self.stats.bytes_in_place += filled as u64;
                processed += filled;
            }
            Lent::Staging { len, .. } => {
                if filled > len {
                    return Err(self.fail(0, DecodeError::FillOverrun { filled, lent: len }));
                }
                self.carry += filled;
            }
        }
        match self.drain(protocol, &mut processed) {
            Ok(yielded) => Ok((prior + filled, yielded)),
            Err(err) => Err(self.fail(processed, err)),
        }
    }

    /// 外部输入路径：先消费携带字节，再复制 `data`。
    ///
    /// 返回 `(本次处理的字节数, 让步时未触及的 data 尾部长度)`。
    pub(crate) fn decode(
        &mut self,
        protocol: &mut P,
        data: &[u8],
    ) -> Result<(usize, Option<usize>), DecodeFailure> {
        self.check_poison()?;
        self.lent = None;
        let prior = self.carry;
        let mut processed = 0;
        match self.drain(protocol, &mut processed) {
            Ok(true) => return Ok((prior + data.len(), Some(data.len()))),
            Ok(false) => {}
            Err(err) => return Err(self.fail(processed, err)),
        }

        let mut offset = 0;
        match self.feed(protocol, data, &mut offset, &mut processed) {
            Ok(true) => Ok((prior + data.len(), Some(data.len() - offset))),
            Ok(false) => Ok((prior + data.len(), None)),
            Err(err) => Err(self.fail(processed, err)),
        }
    }

    pub(crate) fn resume(&mut self, protocol: &mut P) -> Result<(usize, bool), DecodeFailure> {
        self.check_poison()?;
        self.lent = None;
        let mut processed = 0;
        match self.drain(protocol, &mut processed) {
            Ok(yielded) => Ok((processed, yielded)),
            Err(err) => Err(self.fail(processed, err)),
        }
    }

    pub(crate) fn apply_resize(&mut self, size: usize) -> Result<(), DecodeError> {
        if self.poisoned {
            return Err(DecodeError::Poisoned);
        }
        self.resize_buffer(size);
        if let Err(err) = self.ensure_fits() {
            return Err(self.fail(0, err).error);
        }
        Ok(())
    }
}
