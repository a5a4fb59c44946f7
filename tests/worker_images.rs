//! Worker projection loading images over HTTP

use catrender::job::OutputFormat;
use catrender::rendering::raster;
use catrender::rendering::worker::{render_bitmap, WorkerOptions};
use image::RgbaImage;
use std::thread;
use std::time::{Duration, Instant};
use tiny_http::{Response, Server};

fn red_png() -> Vec<u8> {
    let img = RgbaImage::from_pixel(8, 8, image::Rgba([255, 0, 0, 255]));
    raster::encode(&img, OutputFormat::Png, 100).unwrap()
}

/// Serve one request after `delay`, returning the base URL
fn serve_png_once(delay: Duration) -> String {
    let server = Server::http("127.0.0.1:0").unwrap();
    let port = server.server_addr().to_ip().unwrap().port();
    thread::spawn(move || {
        if let Ok(request) = server.recv() {
            thread::sleep(delay);
            let response = Response::from_data(red_png())
                .with_header("Content-Type: image/png".parse::<tiny_http::Header>().unwrap());
            let _ = request.respond(response);
        }
    });
    format!("http://127.0.0.1:{}", port)
}

fn page(src: &str) -> String {
    format!(
        r#"<div style="width: 100px; height: 100px"><img src="{}/red.png" style="width: 40px; height: 40px"><p>Teddy</p></div>"#,
        src
    )
}

#[test]
fn remote_image_is_painted() {
    let base = serve_png_once(Duration::ZERO);
    let opts = WorkerOptions {
        scale: 1,
        image_timeout: 5000,
        ..Default::default()
    };
    let img = render_bitmap(&page(&base), &opts).unwrap();
    assert_eq!(img.width(), 100);
    let px = img.get_pixel(10, 10).0;
    assert!(px[0] > 240 && px[1] < 15 && px[2] < 15, "unexpected pixel {:?}", px);
}

#[test]
fn slow_image_is_skipped_after_timeout() {
    let base = serve_png_once(Duration::from_millis(1500));
    let opts = WorkerOptions {
        scale: 1,
        image_timeout: 200,
        ..Default::default()
    };
    let started = Instant::now();
    let img = render_bitmap(&page(&base), &opts).unwrap();
    assert!(started.elapsed() < Duration::from_millis(1400));

    // no image, but the text pass still ran
    assert_eq!(img.get_pixel(10, 10).0, [255, 255, 255, 255]);
    assert!(img.pixels().any(|p| p.0 == [0, 0, 0, 255]));
}
