use std::io::{self, Write};
use std::time::Instant;

/// Single-line terminal progress bar with throughput and ETA.
pub struct ProgressBar {
    width: usize,
    start: Instant,
    last_render: Option<Instant>,
}

impl ProgressBar {
    /// width = number of bar character slots (not including the brackets)
    pub fn new(width: usize) -> Self {
        Self {
            width,
            start: Instant::now(),
            last_render: None,
        }
    }

    /// Render at `percent` (0..=100). Byte counts, when given, add speed and
    /// remaining-time estimates. Rendering is throttled to avoid flooding
    /// slow terminals.
    pub fn render(&mut self, percent: f64, bytes_done: Option<u64>, bytes_total: Option<u64>) {
        let now = Instant::now();
        if let Some(last) = self.last_render {
            if percent < 100.0 && now.duration_since(last).as_millis() < 100 {
                return;
            }
        }
        self.last_render = Some(now);

        let pct = if percent.is_nan() {
            0.0
        } else {
            percent.clamp(0.0, 100.0)
        };

        let filled = ((pct / 100.0) * self.width as f64).round() as usize;
        let empty = self.width.saturating_sub(filled);

        let mut line = format!(
            "\r[{}{}] {:5.1}%",
            "#".repeat(filled),
            "-".repeat(empty),
            pct
        );

        if let (Some(done), Some(total)) = (bytes_done, bytes_total) {
            let elapsed = self.start.elapsed().as_secs_f64();
            if elapsed > 0.5 && done > 0 {
                let rate = done as f64 / elapsed;
                let remaining = (total.saturating_sub(done)) as f64 / rate.max(1.0);
                line.push_str(&format!(
                    "  {:.1} MiB/s  ETA {}",
                    rate / (1024.0 * 1024.0),
                    humantime::format_duration(std::time::Duration::from_secs(remaining as u64))
                ));
            }
        }

        // Pad over any longer previous line
        line.push_str("          ");
        let mut stdout = io::stdout();
        let _ = stdout.write_all(line.as_bytes());
        let _ = stdout.flush();
    }

    pub fn finish(&mut self) {
        self.last_render = None;
        self.render(100.0, None, None);
        println!();
    }
}
