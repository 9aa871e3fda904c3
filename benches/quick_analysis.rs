use criterion::{Criterion, black_box, criterion_group, criterion_main};
use image::{Rgb, RgbImage};
use remote_pilot::detect::GeometricDetector;

/// 1280x720 lock screen: dialog, text field and two buttons
fn lock_screen() -> RgbImage {
    let mut frame = RgbImage::from_pixel(1280, 720, Rgb([60, 60, 70]));
    let mut fill = |x: u32, y: u32, w: u32, h: u32, color: [u8; 3]| {
        for py in y..y + h {
            for px in x..x + w {
                frame.put_pixel(px, py, Rgb(color));
            }
        }
    };
    fill(420, 230, 440, 260, [150, 150, 160]);
    fill(480, 310, 320, 30, [250, 250, 250]);
    fill(560, 420, 100, 36, [20, 40, 90]);
    fill(680, 420, 100, 36, [20, 40, 90]);
    frame
}

fn benchmark_quick_analysis(c: &mut Criterion) {
    let detector = GeometricDetector::default();
    let frame = lock_screen();

    c.bench_function("quick_analysis_1280x720", |b| {
        b.iter(|| {
            let result = detector.quick_analysis(black_box(&frame));
            assert!(result.has_dialog);
        })
    });

    c.bench_function("dialog_box_1280x720", |b| {
        b.iter(|| detector.dialog_box(black_box(&frame)))
    });
}

criterion_group!(benches, benchmark_quick_analysis);
criterion_main!(benches);
