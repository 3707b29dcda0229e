#![feature(test)]

extern crate test;

#[cfg(test)]
mod benches {
    mod flywheel {
        use std::time::Duration;

        use flywheel::TimerBuilder;
        use test::Bencher;

        #[bench]
        fn bench_schedule_and_cancel_thousand_timeouts(b: &mut Bencher) {
            let timer = TimerBuilder::default()
                .with_init_capacity(1_000)
                .build()
                .unwrap();

            b.iter(|| {
                for _ in 0..1_000 {
                    let timeout = timer.schedule(Duration::from_secs(1), |_| {}).unwrap();
                    assert!(timeout.cancel());
                }
            });
        }

        #[bench]
        fn bench_schedule_thousand_far_timeouts(b: &mut Bencher) {
            let timer = TimerBuilder::default()
                .with_ticks_per_wheel(16)
                .with_init_capacity(1_000_000)
                .build()
                .unwrap();

            b.iter(|| {
                for _ in 0..1_000 {
                    timer.schedule(Duration::from_secs(600), |_| {}).unwrap();
                }
            });
        }
    }
}
