use std::{
    fmt::Display,
    io::{stdout, Write},
    sync::atomic::{AtomicBool, Ordering::SeqCst},
};

use tracing_subscriber::EnvFilter;

use crate::trainer::metric::Metric;

static CBCS: AtomicBool = AtomicBool::new(false);

pub fn ansi<T: Display, U: Display>(x: T, y: U) -> String {
    format!("\x1b[{y}m{x}\x1b[0m{}", esc())
}

pub fn set_cbcs(val: bool) {
    CBCS.store(val, SeqCst)
}

pub fn num_cs() -> i32 {
    if CBCS.load(SeqCst) {
        35
    } else {
        36
    }
}

/// Colour prefix restored after every coloured span.
pub fn esc() -> &'static str {
    if CBCS.load(SeqCst) {
        "\x1b[38;5;225m"
    } else {
        ""
    }
}

/// Installs the fmt subscriber, reading `RUST_LOG` and defaulting to `info`.
/// Returns false if a global subscriber was already set.
pub fn init_tracing() -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).try_init().is_ok()
}

/// ` P=2.1 V=0.9 ... P Acc=41.5%` in the order given.
pub fn format_metrics(metrics: &[Metric]) -> String {
    metrics.iter().map(|m| format!(" {}={}{}", m.short_name, fmt_g(m.get()), m.suffix)).collect()
}

pub fn report_train_step(step: usize, lr: f32, metrics: &[Metric], pos_per_sec: f32) {
    println!(
        "step {}, lr={}{} ({} pos/s)",
        ansi(step, num_cs()),
        ansi(fmt_g(lr), num_cs()),
        format_metrics(metrics),
        fmt_g(pos_per_sec)
    );
}

pub fn report_test(prefix: &str, step: usize, label: &str, metrics: &[Metric]) {
    println!("{prefix}step {}{label}{}", ansi(step, num_cs()), format_metrics(metrics));
}

pub fn report_progress(step: usize, total: usize, split: usize, splits: usize) {
    let done = (step % total) as f32 + split as f32 / splits as f32;
    print!("\r{}% of {} steps completed     ", ansi(format!("{:.2}", 100.0 * done / total as f32), 35), total);
    let _ = stdout().flush();
}

/// Shortest of fixed and exponent notation, six significant digits.
pub fn fmt_g(x: f32) -> String {
    if x == 0.0 || !x.is_finite() {
        return format!("{x}");
    }

    let exp = x.abs().log10().floor() as i32;
    if !(-5..6).contains(&exp) {
        let s = format!("{x:.5e}");
        let (mantissa, exponent) = s.split_once('e').unwrap_or((&s, "0"));
        return format!("{}e{exponent}", trim_zeros(mantissa));
    }

    let decimals = (5 - exp).max(0) as usize;
    trim_zeros(&format!("{x:.decimals$}")).to_string()
}

fn trim_zeros(s: &str) -> &str {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.')
    } else {
        s
    }
}
