//! Display refresh engine: I2C + DMA page streaming.
//!
//! The panel hangs off I2C1 at address 0x3C; DMA1 channel 6 feeds the
//! transmit register. A refresh walks the dirty pages: for each one it
//! sends a page-address command block, then the page's 129 bytes (framing
//! prefix plus 128 columns). Both transfers complete into the I2C event
//! interrupt, which picks the next step:
//!
//! ```text
//! Idle -> SetPageAddr -> WritePage -> SetPageAddr -> ... -> Idle
//! ```
//!
//! The ISR stages each page into a private buffer under a brief lock on
//! the frame, so the background can keep drawing the next frame while DMA
//! streams the last one. If the lock is contended the refresh degrades to
//! idle; the next `update` restarts it.

use core::sync::atomic::{AtomicU8, Ordering};

use crate::device;
use crate::device::interrupt;
use crate::timebase::us_since;
use crate::util::spin_lock::{acquire_hw, SpinLock};
use crate::{armv7m, timebase};

use super::FrameBuffer;

/// Panel bus address.
const DISP_ADDR: u8 = 0x3C;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
enum RefreshState {
    Idle = 0,
    DoingInit = 1,
    SetPageAddr = 2,
    WritePage = 3,
}

impl RefreshState {
    fn from_u8(v: u8) -> RefreshState {
        match v {
            1 => RefreshState::DoingInit,
            2 => RefreshState::SetPageAddr,
            3 => RefreshState::WritePage,
            _ => RefreshState::Idle,
        }
    }
}

struct Hw {
    i2c: device::I2C1,
    dma: device::DMA1,
}

static HW: SpinLock<Option<Hw>> = SpinLock::new(None);

/// The frame the background draws into.
static FRAME: SpinLock<FrameBuffer> = SpinLock::new(FrameBuffer::new());

static STATE: AtomicU8 = AtomicU8::new(RefreshState::Idle as u8);
static DIRTY: AtomicU8 = AtomicU8::new(0);
static DMA_PAGE: AtomicU8 = AtomicU8::new(0);

/// DMA source for whatever block is in flight: an init/command string or a
/// staged page copy. Written only while the channel is disabled.
struct Stage(core::cell::UnsafeCell<[u8; super::NUM_COLS + 1]>);
// Safety: written by whoever owns the refresh step (init path or the bus
// ISR) strictly before the DMA that reads it is enabled.
unsafe impl Sync for Stage {}
static STAGE: Stage = Stage(core::cell::UnsafeCell::new([0; super::NUM_COLS + 1]));

/// Panel bring-up command string. Commands are prefixed with 0x00.
static INIT_CMDS: [u8; 10] = [
    0x00, // command framing prefix
    0xAE, // display off
    0x20, 0x02, // page addressing mode
    0x40, // RAM display line 0
    0xA6, // normal (non-inverted) polarity
    0xA0, // segment remap
    0x8D, 0x14, // charge pump on
    0xAF, // display on
];

/// Runs `draw` against the frame buffer. Background tier only.
pub fn with_frame<R>(draw: impl FnOnce(&mut FrameBuffer) -> R) -> R {
    draw(&mut FRAME.lock())
}

/// Starts a DMA-fed transmit of `len` bytes from the staging buffer.
fn start_dma_write(hw: &Hw, len: usize) {
    let src = STAGE.0.get() as u32;

    hw.dma.ccr6.modify(|_, w| w.en().clear_bit());
    hw.dma.cndtr6.write(|w| unsafe { w.ndt().bits(len as u16) });
    hw.dma.cmar6.write(|w| unsafe { w.ma().bits(src) });
    hw.dma.ccr6.modify(|_, w| w.en().set_bit());

    // Clear stale events, then go: addressed write, autoend, `len` bytes.
    hw.i2c.icr.write(|w| unsafe { w.bits(0x0000_3F38) });
    let cr2 = ((DISP_ADDR as u32) << 1)
        | (1 << 25) // AUTOEND
        | (1 << 13) // START
        | ((len as u32) << 16);
    hw.i2c.cr2.write(|w| unsafe { w.bits(cr2) });
}

fn stage_bytes(bytes: &[u8]) {
    // Safety: see Stage; channel is disabled while we're here.
    unsafe {
        (&mut *STAGE.0.get())[..bytes.len()].copy_from_slice(bytes);
    }
}

/// Sends the page-address command block for `page`.
fn set_page_addr(hw: &Hw, page: u8) {
    let cmds = [
        0x00,               // command prefix
        0xB0 | (page & 7),  // page start address
        0x00,               // column low nibble = 0
        0x10,               // column high nibble = 0
    ];
    stage_bytes(&cmds);
    DMA_PAGE.store(page, Ordering::Relaxed);
    STATE.store(RefreshState::SetPageAddr as u8, Ordering::Relaxed);
    start_dma_write(hw, cmds.len());
}

/// Stages and sends one page of frame data. Returns false if the frame is
/// busy (background drawing); the caller degrades to idle.
fn send_page(hw: &Hw, page: u8) -> bool {
    let page = page & 7;
    {
        let frame = match FRAME.try_lock() {
            Ok(f) => f,
            Err(_) => return false,
        };
        stage_bytes(frame.page(page as usize));
    }
    DIRTY.fetch_and(!(1 << page), Ordering::Relaxed);
    DMA_PAGE.store(page, Ordering::Relaxed);
    STATE.store(RefreshState::WritePage as u8, Ordering::Relaxed);
    start_dma_write(hw, super::NUM_COLS + 1);
    true
}

/// Marks the whole frame dirty and kicks the state machine if it's idle.
/// Background tier.
pub fn update() {
    DIRTY.store(0xFF, Ordering::Relaxed);
    armv7m::masked(|| {
        if RefreshState::from_u8(STATE.load(Ordering::Relaxed)) == RefreshState::Idle {
            if let Some(hw) = acquire_hw(&HW) {
                set_page_addr(&hw, 0);
            }
        }
    });
}

/// Bus-complete ISR: advances the page walk.
fn bus_isr() {
    let hw = match acquire_hw(&HW) {
        Some(hw) => hw,
        None => return,
    };
    hw.i2c.icr.write(|w| unsafe { w.bits(0x0000_3F38) });

    match RefreshState::from_u8(STATE.load(Ordering::Relaxed)) {
        RefreshState::SetPageAddr => {
            // Address went out; follow with that page's data.
            let page = DMA_PAGE.load(Ordering::Relaxed);
            if !send_page(&hw, page) {
                STATE.store(RefreshState::Idle as u8, Ordering::Relaxed);
            }
        }
        RefreshState::WritePage => {
            // Data went out; find the next dirty page.
            let mut page = DMA_PAGE.load(Ordering::Relaxed) + 1;
            let dirty = DIRTY.load(Ordering::Relaxed);
            while page < 8 {
                if dirty & (1 << page) != 0 {
                    set_page_addr(&hw, page);
                    return;
                }
                page += 1;
            }
            STATE.store(RefreshState::Idle as u8, Ordering::Relaxed);
        }
        _ => {
            STATE.store(RefreshState::Idle as u8, Ordering::Relaxed);
        }
    }
}

#[interrupt]
fn I2C1_EV() {
    bus_isr();
}

/// Configures the bus and pushes the init sequence, then queues a first
/// full refresh. PB6/PB7 routing to I2C1 is board init's job.
pub fn init(
    i2c: device::I2C1,
    dma: device::DMA1,
    nvic: &mut cortex_m::peripheral::NVIC,
) {
    // Reference-manual example timing for a 16 MHz kernel clock at 400 kHz.
    i2c.timingr.write(|w| unsafe { w.bits(0x1032_0309) });
    // Enable, STOP interrupt, TX DMA requests.
    i2c.cr1.write(|w| unsafe { w.bits(0x0000_4021) });

    // DMA1 channel 6 <- I2C1_TX: memory-to-peripheral, increment memory.
    dma.cselr.modify(|_, w| unsafe { w.c6s().bits(0b0011) });
    let txdr = device::I2C1::ptr() as u32 + 0x28;
    dma.cpar6.write(|w| unsafe { w.pa().bits(txdr) });
    dma.ccr6.write(|w| w.minc().set_bit().dir().set_bit());

    armv7m::set_irq_priority(nvic, device::Interrupt::I2C1_EV, 3);
    armv7m::enable_irq(device::Interrupt::I2C1_EV);

    *HW.lock() = Some(Hw { i2c, dma });
    if let Some(hw) = acquire_hw(&HW) {
        stage_bytes(&INIT_CMDS);
        STATE.store(RefreshState::DoingInit as u8, Ordering::Relaxed);
        start_dma_write(&hw, INIT_CMDS.len());
    }

    // Bring-up normally completes in ~240 µs; give it 500 and move on
    // either way.
    let t0 = timebase::now_us();
    while RefreshState::from_u8(STATE.load(Ordering::Relaxed)) != RefreshState::Idle
        && us_since(t0) < 500
    {}

    update();
}
