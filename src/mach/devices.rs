use std::cell::RefCell;
use std::rc::Rc;

/// ## Device capabilities
///
/// Every peripheral the statement library can touch, as a narrow
/// injected interface. The core calls these and never inspects their
/// internals; concrete terminal, audio, and hardware implementations
/// live outside the crate. The fakes here capture output for tests
/// and headless hosts.

pub trait TextScreen {
    fn print(&mut self, text: &str);
    fn cls(&mut self);
    /// Current cursor column, for print zone alignment.
    fn column(&self) -> usize;
}

pub trait Speaker {
    fn beep(&mut self);
    fn sound(&mut self, frequency: f64, duration: f64);
}

pub trait Printer {
    fn print(&mut self, text: &str);
}

pub trait Disk {
    fn list_files(&self, pattern: &str) -> Vec<String>;
    fn rename(&mut self, from: &str, to: &str) -> bool;
    fn remove(&mut self, path: &str) -> bool;
}

pub trait Keyboard {
    /// Next buffered keypress, if any. INKEY$ and event polling.
    fn check_key(&mut self) -> Option<char>;
    fn num_keys_pending(&self) -> usize;
}

pub trait TimerDevice {
    /// Seconds since midnight.
    fn timer(&self) -> f64;
    fn date(&self) -> String;
    fn time(&self) -> String;
}

pub trait Joystick {
    fn button(&self, button: usize) -> bool;
    fn axis(&self, axis: usize) -> i32;
}

pub trait LightPen {
    fn pressed(&self) -> bool;
}

pub struct Devices {
    pub screen: Box<dyn TextScreen>,
    pub speaker: Box<dyn Speaker>,
    pub printer: Box<dyn Printer>,
    pub disk: Box<dyn Disk>,
    pub keyboard: Box<dyn Keyboard>,
    pub timer: Box<dyn TimerDevice>,
    pub joystick: Box<dyn Joystick>,
    pub light_pen: Box<dyn LightPen>,
}

/// Shared handles into the fake devices, for driving tests.
pub struct FakeHandles {
    pub screen: ScreenCapture,
    pub timer: FakeTimer,
    pub keyboard: FakeKeys,
}

impl Devices {
    /// A full set of capture-only fakes. The returned handles read
    /// back screen output, step the clock, and queue keypresses.
    pub fn fake() -> (Devices, FakeHandles) {
        let capture = ScreenCapture::default();
        let timer = FakeTimer::default();
        let keys = FakeKeys::default();
        let devices = Devices {
            screen: Box::new(FakeScreen {
                capture: capture.clone(),
            }),
            speaker: Box::new(NullSpeaker),
            printer: Box::new(NullPrinter),
            disk: Box::new(NullDisk),
            keyboard: Box::new(FakeKeyboard { keys: keys.clone() }),
            timer: Box::new(timer.clone()),
            joystick: Box::new(NullJoystick),
            light_pen: Box::new(NullLightPen),
        };
        let handles = FakeHandles {
            screen: capture,
            timer,
            keyboard: keys,
        };
        (devices, handles)
    }
}

/// Shared view of the fake screen's output.
#[derive(Clone, Default)]
pub struct ScreenCapture {
    text: Rc<RefCell<String>>,
}

impl ScreenCapture {
    pub fn contents(&self) -> String {
        self.text.borrow().clone()
    }
}

struct FakeScreen {
    capture: ScreenCapture,
}

impl TextScreen for FakeScreen {
    fn print(&mut self, text: &str) {
        self.capture.text.borrow_mut().push_str(text);
    }

    fn cls(&mut self) {
        self.capture.text.borrow_mut().clear();
    }

    fn column(&self) -> usize {
        let text = self.capture.text.borrow();
        match text.rfind('\n') {
            Some(index) => text.len() - index - 1,
            None => text.len(),
        }
    }
}

struct NullSpeaker;

impl Speaker for NullSpeaker {
    fn beep(&mut self) {}
    fn sound(&mut self, _frequency: f64, _duration: f64) {}
}

struct NullPrinter;

impl Printer for NullPrinter {
    fn print(&mut self, _text: &str) {}
}

struct NullDisk;

impl Disk for NullDisk {
    fn list_files(&self, _pattern: &str) -> Vec<String> {
        vec![]
    }
    fn rename(&mut self, _from: &str, _to: &str) -> bool {
        false
    }
    fn remove(&mut self, _path: &str) -> bool {
        false
    }
}

/// Key queue shared between a test and the fake keyboard.
#[derive(Clone, Default)]
pub struct FakeKeys {
    queue: Rc<RefCell<std::collections::VecDeque<char>>>,
}

impl FakeKeys {
    pub fn press(&self, key: char) {
        self.queue.borrow_mut().push_back(key);
    }
}

struct FakeKeyboard {
    keys: FakeKeys,
}

impl Keyboard for FakeKeyboard {
    fn check_key(&mut self) -> Option<char> {
        self.keys.queue.borrow_mut().pop_front()
    }

    fn num_keys_pending(&self) -> usize {
        self.keys.queue.borrow().len()
    }
}

/// Deterministic clock the tests can step by hand.
#[derive(Clone, Default)]
pub struct FakeTimer {
    seconds: Rc<RefCell<f64>>,
}

impl FakeTimer {
    pub fn advance(&self, seconds: f64) {
        *self.seconds.borrow_mut() += seconds;
    }
}

impl TimerDevice for FakeTimer {
    fn timer(&self) -> f64 {
        *self.seconds.borrow()
    }

    fn date(&self) -> String {
        "01-01-1980".to_string()
    }

    fn time(&self) -> String {
        "00:00:00".to_string()
    }
}

struct NullJoystick;

impl Joystick for NullJoystick {
    fn button(&self, _button: usize) -> bool {
        false
    }
    fn axis(&self, _axis: usize) -> i32 {
        0
    }
}

struct NullLightPen;

impl LightPen for NullLightPen {
    fn pressed(&self) -> bool {
        false
    }
}

/// System clock behind the `TimerDevice` interface.
pub struct SystemTimer;

impl TimerDevice for SystemTimer {
    fn timer(&self) -> f64 {
        use chrono::Timelike;
        let now = chrono::Local::now();
        now.num_seconds_from_midnight() as f64 + now.nanosecond() as f64 * 1e-9
    }

    fn date(&self) -> String {
        chrono::Local::now().format("%m-%d-%Y").to_string()
    }

    fn time(&self) -> String {
        chrono::Local::now().format("%H:%M:%S").to_string()
    }
}
