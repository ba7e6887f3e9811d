//! Background user-interface updates.
//!
//! Repaints the OLED every 50 ms. Two screens exist: a summary of the
//! live numbers and a rolling flow graph. With no input hardware in this
//! enclosure the screen selector is a debug-scratch byte, settable from
//! the host with a one-byte POKE.

use arrayvec::ArrayString;
use core::fmt::Write;
use core::sync::atomic::{AtomicU32, Ordering};

use font_5x7::FONT;

use crate::display::{refresh, NUM_COLS, NUM_ROWS};
use crate::timebase::{ms_to_ticks, tick_count, ticks_since};
use crate::{adc, calc, pressure, scratch};

const REDRAW_MS: u32 = 50;

static LAST_DRAW: AtomicU32 = AtomicU32::new(0);

pub fn poll() {
    if ticks_since(LAST_DRAW.load(Ordering::Relaxed)) < ms_to_ticks(REDRAW_MS) {
        return;
    }
    LAST_DRAW.store(tick_count(), Ordering::Relaxed);

    refresh::with_frame(|fb| {
        fb.clear();
        match scratch::read_u8(scratch::SCREEN_SELECT) & 1 {
            0 => summary_screen(fb),
            _ => flow_graph(fb),
        }
    });

    refresh::update();
}

fn summary_screen(fb: &mut crate::display::FrameBuffer) {
    let mut line: ArrayString<24> = ArrayString::new();

    let _ = write!(line, "P1 {:7.2} cmH2O", pressure::pressure_cmh2o(0));
    fb.draw_string(&line, 0, 0, &FONT);

    line.clear();
    let _ = write!(line, "P2 {:7.2} cmH2O", pressure::pressure_cmh2o(1));
    fb.draw_string(&line, 0, 10, &FONT);

    line.clear();
    let _ = write!(line, "F {:6.0} mL/s", calc::flow_avg(120));
    fb.draw_string(&line, 0, 24, &FONT);

    line.clear();
    let _ = write!(line, "BAT {:5}", adc::battery());
    fb.draw_string(&line, 0, 40, &FONT);
}

/// Flow history as a bar per column, newest at the right edge.
fn flow_graph(fb: &mut crate::display::FrameBuffer) {
    const FULL_SCALE: f32 = 2000.0;
    for x in 0..NUM_COLS {
        let back = (NUM_COLS - 1 - x) as u8;
        let v = calc::flow_history(back);
        let h = if v <= 0.0 {
            0
        } else {
            ((v / FULL_SCALE) * (NUM_ROWS - 1) as f32) as i32
        };
        let h = h.min(NUM_ROWS as i32 - 1);
        fb.fill_rect(x as i32, NUM_ROWS as i32 - 1 - h, 1, h + 1);
    }
}
