//! 解码游标：当前字段写到哪里、还差多少字节、字段收齐后执行哪个步骤。

use std::ops::Range;

use crate::step::Step;

/// 当前字段的落点。
pub(crate) enum Target {
    /// 字段原地累积在暂存区 `[start, start + len)`，已收到的部分止于 `head`。
    Staged { start: usize },
    /// 字段写入独立分配的内存。
    Owned { buf: Vec<u8>, filled: usize },
    /// 零长度字段，无需任何字节。
    Vacant,
}

pub(crate) struct Cursor<P> {
    pub(crate) target: Target,
    pub(crate) len: usize,
    pub(crate) remaining: usize,
    pub(crate) step: Option<Step<P>>,
}

impl<P> Cursor<P> {
    pub(crate) fn idle() -> Self {
        Self {
            target: Target::Vacant,
            len: 0,
            remaining: 0,
            step: None,
        }
    }

    /// 已收到的字节数。
    pub(crate) fn filled(&self) -> usize {
        self.len - self.remaining
    }
}

/// `get_buffer` 借出的区间，等待 `decode_filled` 确认。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lent {
    /// 暂存区 `[at, at + len)`。
    Staging { at: usize, len: usize },
    /// 当前字段独立内存中尚缺的 `len` 字节。
    Owned { len: usize },
}

/// 刚刚收齐、交给步骤处理的字段。
pub(crate) enum Completed {
    None,
    Staged(Range<usize>),
    Owned(Vec<u8>),
    /// 已被步骤取走。
    Taken,
}
