//! Booking state and the reducer that owns it.
//!
//! - [`slot_lock`]: TTL-bound slot claims
//! - [`appointment`]: the appointment state machine
//! - [`payment`]: payment records, fees and callback signatures
//! - [`booking`]: the reducer tying them together

pub mod appointment;
pub mod booking;
pub mod payment;
pub mod slot_lock;

pub use appointment::{Appointment, AppointmentStatus, Settlement, StatusChange, TransitionEvent};
pub use booking::{
    BookingAction, BookingEnvironment, BookingPolicy, BookingReducer, BookingState, CheckoutOrder,
    ReapReport,
};
pub use payment::{Payment, PaymentMethod, PaymentStatus, PaymentVerifier};
pub use slot_lock::{Acquisition, SlotLock, SlotLockTable};
