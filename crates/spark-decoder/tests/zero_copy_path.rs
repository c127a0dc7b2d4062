//! `zero_copy_path` 集成测试：借出路径与复制路径产出相同消息，且借出路径不复制字节。
//!
//! # 测试目标（Why）
//! - 零拷贝是本解码器存在的理由：借出区中的消息视图必须直接指向传输层写入的那段内存；
//! - 槽位耗尽触发的轮换、标准容量调整与池化模式都不能破坏这一点。

mod support;

use spark_buffer::{BlockPool, PoolConfig};
use spark_decoder::{DecoderConfig, StreamDecoder, ZeroCopyAllocator};
use support::{Framing, bodies_with_lengths, encode_frames, feed_copied, feed_lent};

fn decoder(capacity: usize, max_slots: usize) -> StreamDecoder<Framing> {
    let allocator = ZeroCopyAllocator::with_max_slots(capacity, max_slots).expect("构造分配器");
    StreamDecoder::new(Framing::default(), allocator).expect("构造解码器")
}

/// 一次借出、一次回填：每个消息视图的地址等于借出区起点加上帧体在流中的偏移。
#[test]
fn views_alias_the_lent_region() {
    let bodies = bodies_with_lengths(&[10, 20, 30]);
    let stream = encode_frames(&bodies);
    let mut decoder = decoder(1024, 32);

    let buf = decoder.get_buffer().expect("借出内存");
    let base = buf.as_ptr() as usize;
    buf[..stream.len()].copy_from_slice(&stream);
    decoder.decode_filled(stream.len()).expect("原地解码");

    let mut offset = 0;
    for (frame, body) in decoder.protocol().frames.iter().zip(&bodies) {
        offset += 2;
        assert!(frame.body.is_shared());
        assert_eq!(frame.body.as_ptr() as usize, base + offset, "视图必须指向借出区");
        assert_eq!(&*frame.body, body.as_slice());
        offset += body.len();
    }
    let stats = decoder.stats();
    assert_eq!(stats.bytes_copied, 0);
    assert_eq!(stats.bytes_in_place, stream.len() as u64);
}

/// 同样的分块，借出路径零复制，复制路径逐字节复制，消息一致。
#[test]
fn lent_and_copied_paths_agree() {
    let bodies = bodies_with_lengths(&[5, 0, 17, 40, 3, 9, 1, 33]);
    let stream = encode_frames(&bodies);

    let mut lent = decoder(128, 4);
    feed_lent(&mut lent, &stream, &[7, 3, 11]);
    let mut copied = decoder(128, 4);
    feed_copied(&mut copied, &stream, &[7, 3, 11]);

    assert_eq!(lent.protocol().bodies(), bodies);
    assert_eq!(copied.protocol().bodies(), bodies);
    assert_eq!(lent.stats().bytes_copied, 0, "借出路径不得复制字节");
    assert_eq!(lent.stats().bytes_in_place, stream.len() as u64);
    assert_eq!(copied.stats().bytes_copied, stream.len() as u64);
    assert!(lent.protocol().frames.iter().all(|f| f.body.is_shared() || f.body.is_empty()));
}

/// 同一分块序列分别经 `decode_filled` 与 `decode` 送入：每一步之后槽位、封存水位、
/// 声明尺寸与轮换次数都保持一致。
#[test]
fn slot_and_cursor_state_evolve_identically_on_both_paths() {
    let bodies = bodies_with_lengths(&[4, 12, 0, 25, 7, 31, 2, 18, 9, 40, 1, 15]);
    let stream = encode_frames(&bodies);
    let mut lent = decoder(128, 3);
    let mut copied = decoder(128, 3);

    let mut offset = 0;
    let mut sizes = [7usize, 3, 11].into_iter().cycle();
    while offset < stream.len() {
        let want = sizes.next().unwrap_or(1);
        let buf = lent.get_buffer().expect("借出内存");
        let n = want.min(buf.len()).min(stream.len() - offset);
        buf[..n].copy_from_slice(&stream[offset..offset + n]);
        lent.decode_filled(n).expect("借出路径解码");

        copied.get_buffer().expect("借出内存");
        copied.decode(&stream[offset..offset + n]).expect("复制路径解码");
        offset += n;

        let (a, b) = (lent.allocator(), copied.allocator());
        assert_eq!(a.slots_used(), b.slots_used(), "偏移 {offset} 处槽位游标不一致");
        assert_eq!(a.sealed(), b.sealed(), "偏移 {offset} 处封存水位不一致");
        assert_eq!(a.size(), b.size(), "偏移 {offset} 处声明尺寸不一致");
        assert_eq!(lent.stats().rotations, copied.stats().rotations);
        assert_eq!(lent.protocol().frames.len(), copied.protocol().frames.len());
    }

    assert_eq!(lent.protocol().bodies(), bodies);
    assert_eq!(copied.protocol().bodies(), bodies);
    assert!(lent.stats().rotations > 0, "十二个帧、三个槽位必然轮换");
}

/// 两个槽位、六个帧一次到达：每切分两个视图轮换一次，尾部随之迁移。
#[test]
fn slot_exhaustion_rotates_blocks_mid_batch() {
    let bodies = bodies_with_lengths(&[5; 6]);
    let stream = encode_frames(&bodies);
    let mut decoder = decoder(512, 2);

    let buf = decoder.get_buffer().expect("借出内存");
    buf[..stream.len()].copy_from_slice(&stream);
    decoder.decode_filled(stream.len()).expect("原地解码");

    let frames = &decoder.protocol().frames;
    assert_eq!(decoder.protocol().bodies(), bodies);
    assert_eq!(decoder.stats().rotations, 3);
    assert_eq!(decoder.stats().bytes_copied, 0);

    let block = |i: usize| frames[i].body.block().expect("共享视图").clone();
    assert!(block(0).ptr_eq(&block(1)));
    assert!(!block(1).ptr_eq(&block(2)), "第三个视图落在轮换后的新块");
    assert!(block(2).ptr_eq(&block(3)));
    assert!(!block(3).ptr_eq(&block(4)));
    assert_eq!(block(0).ref_count(), 2 + 1, "旧块只被两个视图与本测试持有");
}

/// 调小标准容量后，借出区随之缩小，超出容量的帧体改走独立内存。
#[test]
fn resize_buffer_shrinks_lending_window() {
    let bodies = bodies_with_lengths(&[40, 8, 100]);
    let stream = encode_frames(&bodies);
    let mut decoder = decoder(256, 8);

    decoder.resize_buffer(32).expect("调整标准容量");
    assert_eq!(decoder.staging_capacity(), 32);
    assert_eq!(decoder.get_buffer().expect("借出内存").len(), 32);

    feed_lent(&mut decoder, &stream, &[13]);
    let frames = &decoder.protocol().frames;
    assert_eq!(decoder.protocol().bodies(), bodies);
    assert!(!frames[0].body.is_shared(), "超过标准容量的帧体使用独立内存");
    assert!(frames[1].body.is_shared());
}

/// 池化模式：解码器与消息全部释放后，池中没有使用中的块。
#[test]
fn pooled_decoder_returns_every_block() {
    let pool = BlockPool::with_config(&PoolConfig {
        buffer_size: 2048,
        expected_count: 4,
    })
    .expect("构造池");
    let config = DecoderConfig {
        staging_capacity: 512,
        max_slots: Some(8),
        use_memory_pool: true,
        ..DecoderConfig::default()
    };
    let mut decoder =
        StreamDecoder::from_config(Framing::default(), &config, Some(pool.clone()))
            .expect("构造池化解码器");
    assert!(decoder.allocator().capacity() >= 512);

    let bodies = bodies_with_lengths(&[12; 40]);
    let stream = encode_frames(&bodies);
    feed_lent(&mut decoder, &stream, &[100]);
    assert_eq!(decoder.protocol().bodies(), bodies);
    let reused_before = pool.stats().reuses;

    // 释放第一批消息后，旧块回到池中，第二批换块时应当复用它们。
    decoder.protocol_mut().frames.clear();
    feed_lent(&mut decoder, &stream, &[100]);
    assert!(pool.stats().reuses > reused_before, "换块应复用池中的空闲块");

    let protocol = decoder.into_protocol();
    assert_eq!(protocol.bodies(), bodies);
    assert!(pool.stats().in_use_blocks >= 1, "消息仍持有缓冲块");
    drop(protocol);

    let stats = pool.stats();
    assert_eq!(stats.in_use_blocks, 0);
    assert_eq!(stats.foreign_releases, 0);
}
