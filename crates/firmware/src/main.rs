//! Polyvolt is [Embassy](https://embassy.dev)-based firmware for a six-voice polyphonic MIDI-to-CV converter. The
//! firmware runs on the [Nucleo-F767ZI development board](https://www.st.com/en/evaluation-tools/nucleo-f767zi.html),
//! which is powered by an F7-series STM32 microcontroller.
//!
//! MIDI arrives on a serial input at 31250 baud. Each note is given one of six voices, each voice being a pitch
//! voltage plus a gate line; a shared velocity voltage and trigger line accompany every note, and Control Change
//! and pitch bend messages each drive a voltage of their own. The voltages come from three MCP4728 quad DACs which
//! share a bit-banged I²C bus. The DACs ship with identical addresses, so before anything else the firmware gives
//! each one its own address, using the DACs' LDAC inputs as chip selects.
//!
//! For details about the hardware or how to use the device, see the `README`.

#![no_std]
#![no_main]

use defmt::{panic, *};
use embassy_executor::Spawner;
use embassy_stm32::{
    Config, bind_interrupts,
    gpio::{Level, Output, OutputOpenDrain, Speed},
    peripherals,
    time::Hertz,
    usart::{self, RingBufferedUartRx, UartRx},
};
use embassy_sync::{blocking_mutex::raw::CriticalSectionRawMutex, channel::Channel};
use embassy_time::Delay;
use measurements::Voltage;
use polyvolt_lib::{
    configuration::{DAC_ADDRESSES, DACS, Layout, STARTUP_CHANNEL, VDD_VOLTS, VOICES},
    mcp4728::{self, Mcp4728},
    midi::{MidiFrameParser, MidiMessage},
    provisioning::Provisioner,
    soft_i2c::SoftI2cBus,
    voice::VoiceAllocator,
};
use static_cell::StaticCell;

use {defmt_rtt as _, panic_probe as _};

bind_interrupts!(
    #[doc(hidden)]
    struct Irqs {
        USART2 => usart::InterruptHandler<peripherals::USART2>;
    }
);

/// MIDI's fixed serial rate.
const MIDI_BAUD_RATE: u32 = 31_250;

/// Depth of the queue between MIDI input and voicing. At 31250 baud a three-byte message arrives roughly every
/// millisecond.
const MIDI_QUEUE_DEPTH: usize = 16;

type DacBus = SoftI2cBus<Output<'static>, OutputOpenDrain<'static>, Delay>;
type Allocator = VoiceAllocator<DacBus, Output<'static>, Output<'static>, VOICES, DACS>;

/// Messages parsed by [`midi_input`], awaiting [`voicing`]. The voicing task is the only consumer, which keeps it
/// the sole owner of the DAC bus.
static MIDI_MESSAGES: Channel<CriticalSectionRawMutex, MidiMessage, MIDI_QUEUE_DEPTH> = Channel::new();

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    info!("Initializing Polyvolt");

    let mut config = Config::default();
    {
        use embassy_stm32::rcc::*;
        // hse: high-speed external clock
        config.rcc.hse = Some(Hse {
            freq: Hertz(8_000_000),
            mode: HseMode::Bypass,
        });

        // pll: phase-locked loop, crucial for dividing clock
        config.rcc.pll_src = PllSource::HSE;
        config.rcc.pll = Some(Pll {
            prediv: PllPreDiv::DIV4,
            mul: PllMul::MUL216,
            divp: Some(PllPDiv::DIV2), // 8mhz / 4 * 216 / 2 = 216Mhz
            divq: None,
            divr: None,
        });
        config.rcc.ahb_pre = AHBPrescaler::DIV1;
        config.rcc.apb1_pre = APBPrescaler::DIV4;
        config.rcc.apb2_pre = APBPrescaler::DIV2;
        config.rcc.sys = Sysclk::PLL1_P;
    }
    let p = embassy_stm32::init(config);

    // SDA must be open drain so the DACs can pull it low; both lines have external pull-ups
    let scl = Output::new(p.PB8, Level::High, Speed::VeryHigh);
    let sda = OutputOpenDrain::new(p.PB9, Level::High, Speed::VeryHigh);
    let bus = SoftI2cBus::new(scl, sda, Delay);

    // one LDAC line per DAC, in the same order as `DAC_ADDRESSES`
    let ldacs = [
        Output::new(p.PF13, Level::High, Speed::Low),
        Output::new(p.PE9, Level::High, Speed::Low),
        Output::new(p.PE11, Level::High, Speed::Low),
    ];

    info!("Provisioning DAC addresses");
    let mut provisioner = Provisioner::new(bus, ldacs, DAC_ADDRESSES, Delay);
    provisioner.provision();
    // the same bus carries all further DAC traffic
    let (mut bus, mut ldacs, _) = provisioner.release();

    // with UDAC clear in every write command, outputs update as soon as each write is acknowledged; holding LDAC
    // low as well keeps the input and output registers in step
    for ldac in ldacs.iter_mut() {
        ldac.set_low();
    }

    let vdd = Voltage::from_volts(VDD_VOLTS);
    let mut dacs = DAC_ADDRESSES.map(|address| unwrap!(Mcp4728::new(&mut bus, address)));
    for dac in dacs.iter_mut() {
        for channel in mcp4728::Channel::ALL {
            unwrap!(dac.configure(&mut bus, channel, STARTUP_CHANNEL));
        }
        let states = unwrap!(dac.read_all_channels(&mut bus));
        info!(
            "DAC {=u8:#x} ready, outputs at {} V",
            dac.address(),
            states.map(|state| state.voltage(vdd).as_volts())
        );
    }

    let gates = [
        Output::new(p.PG0, Level::Low, Speed::Low),
        Output::new(p.PG1, Level::Low, Speed::Low),
        Output::new(p.PG2, Level::Low, Speed::Low),
        Output::new(p.PG3, Level::Low, Speed::Low),
        Output::new(p.PG9, Level::Low, Speed::Low),
        Output::new(p.PG14, Level::Low, Speed::Low),
    ];
    let trigger = Output::new(p.PF12, Level::Low, Speed::Low);
    let allocator = unwrap!(VoiceAllocator::new(
        bus,
        dacs,
        gates,
        trigger,
        Layout::REFERENCE
    ));

    let mut uart_config = usart::Config::default();
    uart_config.baudrate = MIDI_BAUD_RATE;
    // per RM0410, USART2 RX is served by DMA1 stream 5
    let rx = unwrap!(UartRx::new(
        p.USART2,
        Irqs,
        p.PD6,
        p.DMA1_CH5,
        uart_config
    ));
    static RX_BUFFER: StaticCell<[u8; 64]> = StaticCell::new();
    let rx = rx.into_ring_buffered(RX_BUFFER.init([0; 64]));

    unwrap!(spawner.spawn(voicing(allocator, ldacs)));
    unwrap!(spawner.spawn(midi_input(rx)));
    info!("Listening for MIDI");
}

/// Task responsible for turning the serial byte stream into MIDI messages.
#[embassy_executor::task]
async fn midi_input(mut rx: RingBufferedUartRx<'static>) -> ! {
    let mut parser = MidiFrameParser::new();
    let mut buf = [0_u8; 16];
    loop {
        match rx.read(&mut buf).await {
            Ok(n) => {
                for &byte in &buf[..n] {
                    // malformed frames have already been reported by the parser
                    if let Some(Ok(message)) = parser.push(byte) {
                        MIDI_MESSAGES.send(message).await;
                    }
                }
            }
            Err(e) => {
                warn!("Serial error {}; discarding partial frame", e);
                parser.clear();
            }
        }
    }
}

/// Task responsible for the CV and gate outputs.
///
/// The LDAC lines are kept here only so that they stay driven low for as long as the device runs.
#[embassy_executor::task]
async fn voicing(mut allocator: Allocator, _ldacs: [Output<'static>; DACS]) -> ! {
    loop {
        let message = MIDI_MESSAGES.receive().await;
        trace!("Voicing {}", message);
        // a bus that stops acknowledging leaves every output frozen; there is no way to recover in the field
        if let Err(e) = allocator.dispatch(message) {
            panic!("Voicing failed: {}", e);
        }
    }
}
