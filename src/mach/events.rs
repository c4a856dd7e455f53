use super::devices::Devices;
use std::collections::BTreeMap;

/// ## Event traps
///
/// A small interrupt-like layer polled once per engine step. Each
/// channel tracks an enabled/disabled/stopped state plus a pending
/// flag; `poll` samples raw device state, and `trap` hands the engine
/// at most one pending trigger per step, stopping that channel so it
/// cannot re-fire while its handler is still running. The handler's
/// RETURN re-enables it.

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Channel {
    Timer,
    Key(u8),
    Strig(u8),
    Pen,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TrapState {
    On,
    Off,
    Stopped,
}

#[derive(Clone, Debug)]
struct Trap {
    state: TrapState,
    triggered: bool,
    target: Option<usize>,
}

impl Default for Trap {
    fn default() -> Trap {
        Trap {
            state: TrapState::Off,
            triggered: false,
            target: None,
        }
    }
}

impl Trap {
    fn set_state(&mut self, state: TrapState) {
        self.state = state;
        if state == TrapState::Off {
            self.triggered = false;
        }
    }

    fn take(&mut self) -> Option<usize> {
        if self.state != TrapState::On || !self.triggered {
            return None;
        }
        self.triggered = false;
        self.state = TrapState::Stopped;
        self.target
    }
}

/// A pending SLEEP: cancelled by any trigger, a new keypress, or the
/// duration elapsing. Zero duration means wait for a keypress alone.
#[derive(Clone, Copy, Debug)]
struct Sleep {
    start: f64,
    duration: f64,
    keys_pending: usize,
}

#[derive(Default)]
pub struct Events {
    timer: Trap,
    timer_start: Option<f64>,
    timer_duration: f64,
    keys: BTreeMap<u8, Trap>,
    strigs: BTreeMap<u8, Trap>,
    pen: Trap,
    sleep: Option<Sleep>,
}

/// One trigger handed to the engine: run a GOSUB to `target` in the
/// top-level chunk and re-enable `channel` when it returns.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Trigger {
    pub channel: Channel,
    pub target: usize,
}

impl Events {
    pub fn new() -> Events {
        Events::default()
    }

    /// ON TIMER(n) GOSUB: arm the channel with its period and handler.
    pub fn arm_timer(&mut self, now: f64, duration: f64, target: usize) {
        self.timer_start = Some(now);
        self.timer_duration = duration;
        self.timer.target = Some(target);
    }

    pub fn arm(&mut self, channel: Channel, target: usize) {
        self.trap_mut(channel).target = Some(target);
    }

    pub fn set_state(&mut self, channel: Channel, state: TrapState) {
        self.trap_mut(channel).set_state(state);
    }

    /// Sample raw device state into pending flags. Called once per
    /// engine step, never on a host timer.
    pub fn poll(&mut self, devices: &mut Devices) {
        log::trace!("poll event channels");
        if self.timer.state == TrapState::On {
            if let Some(start) = self.timer_start {
                if devices.timer.timer() >= start + self.timer_duration {
                    self.timer.triggered = true;
                }
            }
        }
        if devices.keyboard.num_keys_pending() > 0 {
            for trap in self.keys.values_mut() {
                if trap.state == TrapState::On {
                    trap.triggered = true;
                }
            }
        }
        for (button, trap) in self.strigs.iter_mut() {
            if trap.state == TrapState::On && devices.joystick.button(*button as usize) {
                trap.triggered = true;
            }
        }
        if self.pen.state == TrapState::On && devices.light_pen.pressed() {
            self.pen.triggered = true;
        }
    }

    /// At most one pending trigger per poll, lowest channel first.
    /// The taken channel transitions to stopped so it cannot re-fire
    /// until `resume` runs.
    pub fn trap(&mut self, devices: &mut Devices) -> Option<Trigger> {
        if let Some(target) = self.timer.take() {
            self.timer_start = Some(devices.timer.timer());
            return Some(Trigger {
                channel: Channel::Timer,
                target,
            });
        }
        for (key, trap) in self.keys.iter_mut() {
            if let Some(target) = trap.take() {
                return Some(Trigger {
                    channel: Channel::Key(*key),
                    target,
                });
            }
        }
        for (button, trap) in self.strigs.iter_mut() {
            if let Some(target) = trap.take() {
                return Some(Trigger {
                    channel: Channel::Strig(*button),
                    target,
                });
            }
        }
        if let Some(target) = self.pen.take() {
            return Some(Trigger {
                channel: Channel::Pen,
                target,
            });
        }
        None
    }

    /// The handler's RETURN: a channel stopped by `trap` goes back on.
    pub fn resume(&mut self, channel: Channel) {
        let trap = self.trap_mut(channel);
        if trap.state == TrapState::Stopped {
            trap.state = TrapState::On;
        }
    }

    pub fn start_sleep(&mut self, start: f64, duration: f64, keys_pending: usize) {
        self.sleep = Some(Sleep {
            start,
            duration,
            keys_pending,
        });
    }

    /// Whether a SLEEP is still holding execution. Clears the record
    /// once any cancel condition is met.
    pub fn sleeping(&mut self, devices: &mut Devices) -> bool {
        let sleep = match self.sleep {
            Some(sleep) => sleep,
            None => return false,
        };
        let expired = sleep.duration > 0.0
            && devices.timer.timer() >= sleep.start + sleep.duration;
        let keypress = devices.keyboard.num_keys_pending() > sleep.keys_pending;
        let triggered = self.any_triggered();
        if expired || keypress || triggered {
            self.sleep = None;
            return false;
        }
        true
    }

    fn any_triggered(&self) -> bool {
        self.timer.triggered
            || self.keys.values().any(|t| t.triggered)
            || self.strigs.values().any(|t| t.triggered)
            || self.pen.triggered
    }

    fn trap_mut(&mut self, channel: Channel) -> &mut Trap {
        match channel {
            Channel::Timer => &mut self.timer,
            Channel::Key(n) => self.keys.entry(n).or_insert_with(Trap::default),
            Channel::Strig(n) => self.strigs.entry(n).or_insert_with(Trap::default),
            Channel::Pen => &mut self.pen,
        }
    }
}
