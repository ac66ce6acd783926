#[macro_use]
extern crate criterion;

use bytes::BytesMut;
use criterion::Criterion;
use tokio_util::codec::Decoder;

use shoal::protocol::codec::RespCodec;
use shoal::protocol::command::{get_op_str, hash_slot};
use shoal::protocol::resp::Resp;

fn bench_decode(c: &mut Criterion) {
    c.bench_function("decode plain", |b| {
        let data = &b"+OK\r\n"[..];
        b.iter(|| {
            let mut codec = RespCodec::default();
            let mut src = BytesMut::from(data);
            codec.decode(&mut src).unwrap().unwrap()
        })
    });

    c.bench_function("decode bulk", |b| {
        let data = &b"$12\r\nhello world!\r\n"[..];
        b.iter(|| {
            let mut codec = RespCodec::default();
            let mut src = BytesMut::from(data);
            codec.decode(&mut src).unwrap().unwrap()
        })
    });

    c.bench_function("decode command", |b| {
        let data = &b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n"[..];
        b.iter(|| {
            let mut codec = RespCodec::default();
            let mut src = BytesMut::from(data);
            codec.decode(&mut src).unwrap().unwrap()
        })
    });
}

fn bench_classify(c: &mut Criterion) {
    c.bench_function("hash slot", |b| {
        b.iter(|| hash_slot(b"user:{1000}:profile"))
    });

    c.bench_function("op str fast path", |b| {
        let multi = vec![Resp::bulk(b"getrange"), Resp::bulk(b"k")];
        b.iter(|| get_op_str(&multi).unwrap())
    });
}

criterion_group!(benches, bench_decode, bench_classify);
criterion_main!(benches);
