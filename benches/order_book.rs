use arb_watch::order_book::{LocalOrderBook, Side};
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use rand::Rng;

fn initialize_order_book() -> LocalOrderBook {
    let mut book = LocalOrderBook::new();
    let mut rng = rand::thread_rng();

    for _ in 0..100 {
        let price: f64 = rng.gen_range(80.0..100.0);
        let size: f64 = rng.gen_range(0.1..50.0);
        book.apply_level(Side::Bid, price, size);
    }

    for _ in 0..100 {
        let price: f64 = rng.gen_range(100.1..120.0);
        let size: f64 = rng.gen_range(0.1..50.0);
        book.apply_level(Side::Ask, price, size);
    }

    book
}

fn bench_apply_level(c: &mut Criterion) {
    let mut book = initialize_order_book();
    let mut rng = rand::thread_rng();

    c.bench_function("apply level", |b| {
        b.iter_batched(
            || {
                let price: f64 = rng.gen_range(80.0..100.0);
                let size: f64 = rng.gen_range(0.0..50.0);
                (price, size)
            },
            |(price, size)| book.apply_level(Side::Bid, black_box(price), black_box(size)),
            BatchSize::SmallInput,
        )
    });
}

fn bench_remove_level(c: &mut Criterion) {
    c.bench_function("remove level", |b| {
        b.iter_batched(
            || {
                let book = initialize_order_book();
                let price = book.best_bid().expect("book has bids");
                (book, price)
            },
            |(mut book, price)| book.apply_level(Side::Bid, black_box(price), 0.0),
            BatchSize::SmallInput,
        )
    });
}

fn bench_best_levels(c: &mut Criterion) {
    let book = initialize_order_book();

    c.bench_function("best levels", |b| b.iter(|| black_box(book.best_levels())));
}

criterion_group!(
    benches,
    bench_apply_level,
    bench_remove_level,
    bench_best_levels
);
criterion_main!(benches);
