use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use anyhow::{anyhow, Context, Result};
use folio_core::{DetectedWord, RenderImage, TextDetector};
use image::{DynamicImage, GrayImage, RgbaImage};
use tracing::{debug, instrument};
use uuid::Uuid;

/// Locates words on rendered pages by shelling out to the tesseract binary.
///
/// Input bitmaps are grayscaled and binarized with an Otsu threshold before
/// recognition, which sharpens scanned pages considerably.
pub struct TesseractDetector {
    language: String,
}

impl TesseractDetector {
    pub fn new(language: impl Into<String>) -> Self {
        Self {
            language: language.into(),
        }
    }

    /// Checks whether the tesseract binary is reachable on PATH.
    pub fn is_available() -> bool {
        process::Command::new("tesseract")
            .arg("--version")
            .output()
            .is_ok()
    }

    fn run_tesseract(&self, input: &Path) -> Result<String> {
        let output = process::Command::new("tesseract")
            .arg(input)
            .arg("stdout")
            .arg("-l")
            .arg(&self.language)
            .arg("--oem")
            .arg("3")
            .arg("--psm")
            .arg("3")
            .arg("tsv")
            .output()
            .context("failed to run tesseract; is it installed?")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "tesseract exited with {}: {}",
                output.status,
                stderr.trim()
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl TextDetector for TesseractDetector {
    #[instrument(skip(self, image))]
    fn detect(&self, image: &RenderImage) -> Result<Vec<DetectedWord>> {
        let gray = grayscale(image)?;
        let level = otsu_level(&gray);
        let prepared = binarize(&gray, level);

        let input = write_temp_png(&prepared, &env::temp_dir())?;
        let result = self.run_tesseract(&input);
        if let Err(err) = fs::remove_file(&input) {
            debug!(?err, path = %input.display(), "failed to remove OCR input image");
        }
        let output = result?;

        let words = parse_tsv(&output);
        debug!(words = words.len(), "text detection finished");
        Ok(words)
    }
}

/// Detector used when OCR is disabled or tesseract is missing. Pages index
/// as empty, which keeps the rest of the session unaware of the difference.
pub struct NoopDetector;

impl TextDetector for NoopDetector {
    fn detect(&self, _image: &RenderImage) -> Result<Vec<DetectedWord>> {
        Ok(Vec::new())
    }
}

pub fn grayscale(image: &RenderImage) -> Result<GrayImage> {
    let rgba = RgbaImage::from_raw(image.width, image.height, image.pixels.clone()).ok_or_else(
        || {
            anyhow!(
                "pixel buffer does not match {}x{}",
                image.width,
                image.height
            )
        },
    )?;
    Ok(DynamicImage::ImageRgba8(rgba).to_luma8())
}

/// Otsu's method: the threshold that maximizes between-class variance over
/// the intensity histogram.
pub fn otsu_level(image: &GrayImage) -> u8 {
    let mut histogram = [0u64; 256];
    for pixel in image.pixels() {
        histogram[pixel.0[0] as usize] += 1;
    }
    let total: u64 = histogram.iter().sum();
    if total == 0 {
        return 0;
    }

    let weighted_total: f64 = histogram
        .iter()
        .enumerate()
        .map(|(level, count)| level as f64 * *count as f64)
        .sum();

    let mut best_level = 0u8;
    let mut best_variance = 0.0f64;
    let mut background_count = 0u64;
    let mut background_sum = 0.0f64;

    for level in 0..256usize {
        background_count += histogram[level];
        if background_count == 0 {
            continue;
        }
        let foreground_count = total - background_count;
        if foreground_count == 0 {
            break;
        }
        background_sum += level as f64 * histogram[level] as f64;

        let background_mean = background_sum / background_count as f64;
        let foreground_mean = (weighted_total - background_sum) / foreground_count as f64;
        let difference = background_mean - foreground_mean;
        let variance = background_count as f64 * foreground_count as f64 * difference * difference;
        if variance > best_variance {
            best_variance = variance;
            best_level = level as u8;
        }
    }

    best_level
}

pub fn binarize(image: &GrayImage, threshold: u8) -> GrayImage {
    let mut out = image.clone();
    for pixel in out.pixels_mut() {
        pixel.0[0] = if pixel.0[0] > threshold { 255 } else { 0 };
    }
    out
}

// Tesseract TSV rows: level page_num block_num par_num line_num word_num
// left top width height conf text. Words carry level 5.
fn parse_tsv(output: &str) -> Vec<DetectedWord> {
    let mut words = Vec::new();
    for line in output.lines().skip(1) {
        let columns: Vec<&str> = line.split('\t').collect();
        if columns.len() < 12 {
            continue;
        }
        if columns[0].trim() != "5" {
            continue;
        }
        let (Ok(x), Ok(y), Ok(width), Ok(height)) = (
            columns[6].trim().parse::<u32>(),
            columns[7].trim().parse::<u32>(),
            columns[8].trim().parse::<u32>(),
            columns[9].trim().parse::<u32>(),
        ) else {
            continue;
        };
        words.push(DetectedWord {
            text: columns[11].to_string(),
            x,
            y,
            width,
            height,
        });
    }
    words
}

fn write_temp_png(image: &GrayImage, dir: &Path) -> Result<PathBuf> {
    let path = dir.join(format!("folio_ocr_{}.png", Uuid::new_v4()));
    image
        .save(&path)
        .with_context(|| format!("failed to write OCR input image to {:?}", path))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn otsu_separates_a_bimodal_image() {
        let mut image = GrayImage::new(10, 10);
        for (i, pixel) in image.pixels_mut().enumerate() {
            *pixel = Luma([if i % 2 == 0 { 40 } else { 200 }]);
        }
        let level = otsu_level(&image);
        assert!((40..200).contains(&level), "level {level} outside the gap");
    }

    #[test]
    fn otsu_handles_a_uniform_image() {
        let image = GrayImage::from_pixel(8, 8, Luma([128]));
        let level = otsu_level(&image);
        let out = binarize(&image, level);
        assert!(out.pixels().all(|p| p.0[0] == 255));
    }

    #[test]
    fn binarize_produces_only_black_and_white() {
        let mut image = GrayImage::new(4, 1);
        image.put_pixel(0, 0, Luma([10]));
        image.put_pixel(1, 0, Luma([90]));
        image.put_pixel(2, 0, Luma([91]));
        image.put_pixel(3, 0, Luma([255]));

        let out = binarize(&image, 90);
        let values: Vec<u8> = out.pixels().map(|p| p.0[0]).collect();
        assert_eq!(values, vec![0, 0, 255, 255]);
    }

    #[test]
    fn parse_tsv_keeps_word_rows_only() {
        let output = "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext\n\
                      1\t1\t0\t0\t0\t0\t0\t0\t600\t800\t-1\t\n\
                      5\t1\t1\t1\t1\t1\t72\t88\t120\t24\t96.1\tHello\n\
                      5\t1\t1\t1\t1\t2\t200\t88\t90\t24\t95.0\tworld\n\
                      5\t1\t1\t1\t1\t3\tnoise\t88\t90\t24\t12.0\tbroken\n";

        let words = parse_tsv(output);
        assert_eq!(words.len(), 2);
        assert_eq!(words[0].text, "Hello");
        assert_eq!(words[0].x, 72);
        assert_eq!(words[0].y, 88);
        assert_eq!(words[0].width, 120);
        assert_eq!(words[0].height, 24);
        assert_eq!(words[1].text, "world");
    }

    #[test]
    fn parse_tsv_keeps_blank_word_text() {
        // Blank tokens are filtered later, at indexing time.
        let output = "level\t...\theader\n\
                      5\t1\t1\t1\t1\t1\t10\t20\t30\t40\t95.0\t\n";
        let words = parse_tsv(output);
        assert_eq!(words.len(), 1);
        assert_eq!(words[0].text, "");
    }

    #[test]
    fn grayscale_rejects_a_mismatched_buffer() {
        let image = RenderImage {
            width: 4,
            height: 4,
            pixels: vec![0; 7],
        };
        assert!(grayscale(&image).is_err());
    }

    #[test]
    fn grayscale_converts_rgba() {
        let image = RenderImage {
            width: 2,
            height: 1,
            pixels: vec![255, 0, 0, 255, 0, 0, 255, 255],
        };
        let gray = grayscale(&image).unwrap();
        assert_eq!(gray.dimensions(), (2, 1));
    }

    #[test]
    fn write_temp_png_creates_a_readable_file() {
        let dir = tempfile::tempdir().unwrap();
        let image = GrayImage::from_pixel(6, 3, Luma([255]));

        let path = write_temp_png(&image, dir.path()).unwrap();
        assert!(path.exists());
        let reloaded = image::open(&path).unwrap().to_luma8();
        assert_eq!(reloaded.dimensions(), (6, 3));
    }
}
