#![no_std]
#![no_main]
#![deny(
    clippy::mem_forget,
    reason = "mem::forget is generally not safe to do with esp_hal types, especially those \
    holding buffers for the duration of a data transfer."
)]
#![deny(clippy::large_stack_frames)]

use alloc::string::String;

use embassy_executor::Spawner;
use embassy_net::{Runner, StackResources};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_time::{Duration, Instant, Ticker};
use embedded_io_async::{Read, Write};
use esp_hal::Async;
use esp_hal::Blocking;
use esp_hal::clock::CpuClock;
use esp_hal::delay::Delay;
use esp_hal::gpio::{DriveMode, Flex, Level, Output, OutputConfig, Pull};
use esp_hal::i2c::master::{Config as I2cConfig, I2c};
use esp_hal::rng::Rng;
use esp_hal::time::Rate;
use esp_hal::timer::timg::TimerGroup;
use esp_hal::usb_serial_jtag::{UsbSerialJtag, UsbSerialJtagRx};
use esp_radio::wifi::WifiDevice;
use esp_storage::FlashStorage;
use log::{error, info, warn};
use rtt_target::rprintln;
use static_cell::StaticCell;

use probe_core::console::{LineEditor, response_line};
use probe_core::probe::{Drivers, Platform, heartbeat};
use probe_core::{Probe, ProbeConfig};
use probe_firmware::factory;
use probe_firmware::flash::FlashBlobStore;
use probe_firmware::net::{
    EmbassyHttpClient, EmbassyWsTransport, HttpBuffers, StreamBuffers, StreamLink, stream_task,
};
use probe_firmware::sensors::{Dht11, Pcf8591};
use probe_firmware::wifi::EspRadio;

/// Main loop period
const TICK: Duration = Duration::from_millis(20);

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    rtt_target::rprintln!("PANIC: {}", info);
    loop {}
}

extern crate alloc;

// This creates a default app-descriptor required by the esp-idf bootloader.
// For more information see: <https://docs.espressif.com/projects/esp-idf/en/stable/esp32/api-reference/system/app_image_format.html#application-description>
esp_bootloader_esp_idf::esp_app_desc!();

struct Esp32;

impl Platform for Esp32 {
    type Store = FlashBlobStore;
    type Radio = EspRadio;
    type Http = EmbassyHttpClient;
    type Stream = EmbassyWsTransport;
    type Climate = Dht11<Flex<'static>, Delay>;
    type Analog = Pcf8591<I2c<'static, Blocking>>;
}

/// Completed console lines, handed from the serial reader to the main loop
static CONSOLE_LINES: Channel<CriticalSectionRawMutex, String, 4> = Channel::new();

static RADIO: StaticCell<esp_radio::Controller<'static>> = StaticCell::new();
static NET_RESOURCES: StaticCell<StackResources<4>> = StaticCell::new();
static HTTP_BUFFERS: StaticCell<HttpBuffers> = StaticCell::new();
static STREAM_BUFFERS: StaticCell<StreamBuffers> = StaticCell::new();
static STREAM_LINK: StreamLink = StreamLink::new();

#[embassy_executor::task]
async fn net_task(mut runner: Runner<'static, WifiDevice<'static>>) {
    runner.run().await
}

#[embassy_executor::task]
async fn console_task(mut rx: UsbSerialJtagRx<'static, Async>) {
    let mut editor = LineEditor::new();
    let mut buf = [0u8; 32];
    loop {
        let n = match rx.read(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                warn!("console: read failed: {:?}", e);
                continue;
            }
        };
        for byte in &buf[..n] {
            if let Some(line) = editor.push(*byte) {
                CONSOLE_LINES.send(line).await;
            }
        }
    }
}

#[allow(
    clippy::large_stack_frames,
    reason = "it's not unusual to allocate larger buffers etc. in main"
)]
#[esp_rtos::main]
async fn main(spawner: Spawner) -> ! {
    rtt_target::rtt_init_log!(log::LevelFilter::Info);

    let config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
    let peripherals = esp_hal::init(config);

    esp_alloc::heap_allocator!(#[esp_hal::ram(reclaimed)] size: 73744);

    let timg0 = TimerGroup::new(peripherals.TIMG0);
    esp_rtos::start(timg0.timer0);

    rprintln!("Embassy initialized!");

    // WiFi station and the DHCP-configured network stack on top of it
    let rng = Rng::new();
    let radio_init =
        RADIO.init(esp_radio::init().expect("Failed to initialize Wi-Fi/BLE controller"));
    let (wifi_controller, interfaces) =
        esp_radio::wifi::new(radio_init, peripherals.WIFI, Default::default())
            .expect("Failed to initialize Wi-Fi controller");

    let seed = (u64::from(rng.random()) << 32) | u64::from(rng.random());
    let (stack, runner) = embassy_net::new(
        interfaces.sta,
        embassy_net::Config::dhcpv4(Default::default()),
        NET_RESOURCES.init(StackResources::new()),
        seed,
    );
    spawner.must_spawn(net_task(runner));

    let probe_config = ProbeConfig::default();
    spawner.must_spawn(stream_task(
        stack,
        STREAM_BUFFERS.init(StreamBuffers::new()),
        &STREAM_LINK,
        Rng::new(),
        probe_config.request_timeout(),
    ));

    // Sensors: DHT11 on an open-drain GPIO, PCF8591 on I2C0
    let mut dht_pin = Flex::new(peripherals.GPIO4);
    dht_pin.apply_output_config(
        &OutputConfig::default()
            .with_drive_mode(DriveMode::OpenDrain)
            .with_pull(Pull::Up),
    );
    dht_pin.set_input_enable(true);
    dht_pin.set_output_enable(true);

    let i2c = I2c::new(
        peripherals.I2C0,
        I2cConfig::default().with_frequency(Rate::from_khz(100)),
    )
    .expect("Failed to initialize I2C")
    .with_sda(peripherals.GPIO8)
    .with_scl(peripherals.GPIO9);

    // Serial console over the built-in USB serial/JTAG port
    let (console_rx, mut console_tx) = UsbSerialJtag::new(peripherals.USB_DEVICE)
        .into_async()
        .split();
    spawner.must_spawn(console_task(console_rx));

    let mut led = Output::new(peripherals.GPIO2, Level::Low, OutputConfig::default());

    let drivers = Drivers::<Esp32> {
        store: FlashBlobStore::new(FlashStorage::new(peripherals.FLASH)),
        radio: EspRadio::new(wifi_controller, stack),
        http: EmbassyHttpClient::new(stack, HTTP_BUFFERS.init(HttpBuffers::new())),
        stream: EmbassyWsTransport::new(&STREAM_LINK),
        climate: Dht11::new(dht_pin, Delay::new()),
        analog: Pcf8591::new(i2c),
    };
    let mut probe = Probe::new(drivers, probe_config);

    if let Some((ssid, password)) = factory::network() {
        match probe.seed_network(ssid, password) {
            Ok(true) => info!("Factory network '{}' stored", ssid),
            Ok(false) => {}
            Err(e) => error!("Cannot store factory network: {}", e),
        }
    }

    info!("Soil probe running");

    let mut ticker = Ticker::every(TICK);
    loop {
        let now = Instant::now();

        if let Ok(line) = CONSOLE_LINES.try_receive() {
            let result = probe.execute(&line, now);
            let mut response = response_line(&result);
            response.push_str("\r\n");
            if let Err(e) = console_tx.write_all(response.as_bytes()).await {
                warn!("console: write failed: {:?}", e);
            }
        }

        probe.tick(now).await;
        led.set_level(Level::from(heartbeat(now)));
        ticker.next().await;
    }
}
