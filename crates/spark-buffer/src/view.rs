use std::{fmt, ops::Deref, ops::Range};

use bytes::Bytes;

use crate::block::BlockHandle;

/// 解码产出的消息视图。
///
/// # 模块角色（Why）
/// - 小于暂存区容量的消息直接指向接收缓冲块内部，既不复制也不单独分配；
/// - 超大消息由解码器写入独立分配的内存，以 `Bytes` 形式持有。
///
/// # 契约说明（What）
/// - `Shared` 视图对缓冲块贡献一份引用计数，克隆再贡献一份，析构时归还；
/// - 视图覆盖的字节已被分配器封存，此后在视图存活期间不会被改写；
/// - 视图可以跨线程移动与释放，与分配器的轮换并发进行。
#[derive(Clone)]
pub struct MessageView {
    repr: Repr,
}

#[derive(Clone)]
enum Repr {
    Shared { block: BlockHandle, range: Range<usize> },
    Owned(Bytes),
}

impl MessageView {
    pub(crate) fn shared(block: BlockHandle, range: Range<usize>) -> Self {
        Self {
            repr: Repr::Shared { block, range },
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.repr {
            // SAFETY: 视图区间位于切分时的封存水位之下，分配器此后只写水位之上的区间，
            // 或在成为唯一持有者后才重新使用整块；本视图的持有阻止了后一种情况。
            Repr::Shared { block, range } => unsafe { block.0.slice(range.clone()) },
            Repr::Owned(bytes) => bytes.as_ref(),
        }
    }

    /// 是否指向共享缓冲块（零拷贝视图）。
    pub fn is_shared(&self) -> bool {
        matches!(self.repr, Repr::Shared { .. })
    }

    /// 共享视图所在的缓冲块。
    pub fn block(&self) -> Option<&BlockHandle> {
        match &self.repr {
            Repr::Shared { block, .. } => Some(block),
            Repr::Owned(_) => None,
        }
    }

    /// 共享视图在接收区内的起始偏移。
    pub fn offset(&self) -> Option<usize> {
        match &self.repr {
            Repr::Shared { range, .. } => Some(range.start),
            Repr::Owned(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 转换为 `Bytes`，共享视图的引用计数随之转移而不复制数据。
    pub fn into_bytes(self) -> Bytes {
        match self.repr {
            Repr::Owned(bytes) => bytes,
            shared @ Repr::Shared { .. } => Bytes::from_owner(MessageView { repr: shared }),
        }
    }
}

impl Deref for MessageView {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsRef<[u8]> for MessageView {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl From<Vec<u8>> for MessageView {
    fn from(value: Vec<u8>) -> Self {
        Self {
            repr: Repr::Owned(Bytes::from(value)),
        }
    }
}

impl From<Bytes> for MessageView {
    fn from(value: Bytes) -> Self {
        Self {
            repr: Repr::Owned(value),
        }
    }
}

impl PartialEq for MessageView {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for MessageView {}

impl PartialEq<[u8]> for MessageView {
    fn eq(&self, other: &[u8]) -> bool {
        self.as_slice() == other
    }
}

impl fmt::Debug for MessageView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageView")
            .field("len", &self.len())
            .field("shared", &self.is_shared())
            .field("offset", &self.offset())
            .finish()
    }
}
