use std::mem;

use spark_buffer::{MessageView, ZeroCopyAllocator};

use crate::{
    cursor::Completed,
    engine::Engine,
    error::DecodeError,
};

/// 解析步骤：字段收齐后由引擎调用。
///
/// 步骤从 [`StepContext::field`] 读取刚收齐的字段，决定下一个字段的长度与落点，
/// 并且必须通过 [`StepContext::next_step`] 安排后继步骤。
pub type Step<P> = fn(&mut P, &mut StepContext<'_, P>) -> Result<StepOutcome, DecodeError>;

/// 步骤执行结果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// 继续消费输入。
    Continue,
    /// 背压：本次调用立即返回，剩余输入的处理方式见 [`Leftover`](crate::Leftover)。
    Yield,
}

/// 下一个字段的落点。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldTarget {
    /// 原地累积在暂存区，可被零拷贝切分为消息视图。
    /// 长度超过标准暂存容量时自动改为 [`FieldTarget::Owned`]。
    InPlace,
    /// 写入独立分配的内存。
    Owned,
}

/// 线路协议：以一组步骤描述帧结构。
///
/// 引擎从不解读字节内容，只负责按步骤声明的长度收集字节。
pub trait Protocol: Sized {
    /// 安排第一个步骤。
    fn start(&mut self, ctx: &mut StepContext<'_, Self>);
}

/// 步骤执行期间对引擎的受限访问。
///
/// # 契约说明（What）
/// - 每个上下文对应一个刚收齐的字段；[`carve`](Self::carve) 或
///   [`take_owned`](Self::take_owned) 取走该字段后，[`field`](Self::field) 返回空切片；
/// - [`next_step`](Self::next_step) 必须至少调用一次，多次调用以最后一次为准；
/// - 切分视图可能触发缓冲块轮换，轮换对步骤透明。
pub struct StepContext<'a, P> {
    engine: &'a mut Engine<P>,
    completed: Completed,
    scheduled: bool,
}

impl<'a, P> StepContext<'a, P> {
    pub(crate) fn new(engine: &'a mut Engine<P>, completed: Completed) -> Self {
        Self {
            engine,
            completed,
            scheduled: false,
        }
    }

    pub(crate) fn scheduled(&self) -> bool {
        self.scheduled
    }

    /// 刚收齐的字段字节。
    pub fn field(&self) -> &[u8] {
        match &self.completed {
            Completed::Staged(range) => self
                .engine
                .allocator()
                .data()
                .get(range.clone())
                .unwrap_or_default(),
            Completed::Owned(buf) => buf,
            Completed::None | Completed::Taken => &[],
        }
    }

    /// 暂存区中紧随已消费字节的位置。
    pub fn position(&self) -> usize {
        self.engine.head()
    }

    /// 取走写入独立内存的字段；原地字段返回 `None`。
    pub fn take_owned(&mut self) -> Option<Vec<u8>> {
        match mem::replace(&mut self.completed, Completed::Taken) {
            Completed::Owned(buf) => Some(buf),
            other => {
                self.completed = other;
                None
            }
        }
    }

    /// 把刚收齐的字段变成消息视图。
    ///
    /// 原地字段得到指向暂存块的零拷贝视图；独立内存字段直接移交所有权；零长度字段得到空视图。
    pub fn carve(&mut self) -> Result<MessageView, DecodeError> {
        match mem::replace(&mut self.completed, Completed::Taken) {
            Completed::Staged(range) => self.engine.carve_staged(range),
            Completed::Owned(buf) => Ok(MessageView::from(buf)),
            Completed::None | Completed::Taken => Ok(MessageView::from(Vec::new())),
        }
    }

    /// 安排下一个字段：`len` 字节写入 `target`，收齐后调用 `step`。
    pub fn next_step(&mut self, target: FieldTarget, len: usize, step: Step<P>) {
        self.engine.schedule(target, len, step);
        self.scheduled = true;
    }

    /// 调整标准暂存容量。
    pub fn resize_buffer(&mut self, size: usize) {
        self.engine.resize_buffer(size);
    }

    /// 当前标准暂存容量。
    pub fn staging_capacity(&self) -> usize {
        self.engine.standard()
    }

    pub fn allocator(&self) -> &ZeroCopyAllocator {
        self.engine.allocator()
    }
}
