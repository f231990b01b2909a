use std::fmt;
use std::num::NonZeroU8;
use std::ops;

const READABLE: u8 = 0b001;
const WRITABLE: u8 = 0b010;
const ERROR: u8 = 0b100;

/// Interest set used when registering a source with a [`Registry`], and the
/// readiness/event mask reported back on [`Event`].
///
/// Matches §6's event mask bits (`READ=1, WRITE=2, ERROR=4`, combinable).
/// `ERROR` is always implicitly monitored by every backend but is exposed
/// here so callers can test for it on a returned [`Event`].
///
/// [`Registry`]: crate::poller::Registry
/// [`Event`]: crate::event::Event
#[derive(Copy, Clone, PartialEq, Eq)]
#[repr(transparent)]
pub struct Interest(NonZeroU8);

impl Interest {
    pub const READABLE: Interest = Interest(unsafe { NonZeroU8::new_unchecked(READABLE) });
    pub const WRITABLE: Interest = Interest(unsafe { NonZeroU8::new_unchecked(WRITABLE) });
    pub const ERROR: Interest = Interest(unsafe { NonZeroU8::new_unchecked(ERROR) });

    #[allow(clippy::should_implement_trait)]
    pub const fn add(self, other: Interest) -> Interest {
        Interest(unsafe { NonZeroU8::new_unchecked(self.0.get() | other.0.get()) })
    }

    pub const fn remove(self, other: Interest) -> Option<Interest> {
        match NonZeroU8::new(self.0.get() & !other.0.get()) {
            Some(v) => Some(Interest(v)),
            None => None,
        }
    }

    pub const fn is_readable(self) -> bool {
        self.0.get() & READABLE != 0
    }

    pub const fn is_writable(self) -> bool {
        self.0.get() & WRITABLE != 0
    }

    pub const fn is_error(self) -> bool {
        self.0.get() & ERROR != 0
    }

    pub(crate) const fn as_u8(self) -> u8 {
        self.0.get()
    }

    pub(crate) fn from_u8(bits: u8) -> Option<Interest> {
        NonZeroU8::new(bits).map(Interest)
    }
}

impl ops::BitOr for Interest {
    type Output = Self;

    fn bitor(self, other: Self) -> Self {
        self.add(other)
    }
}

impl ops::BitOrAssign for Interest {
    fn bitor_assign(&mut self, other: Self) {
        *self = *self | other;
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        macro_rules! flag {
            ($test:ident, $name:expr) => {
                if self.$test() {
                    if !first {
                        write!(f, " | ")?;
                    }
                    write!(f, $name)?;
                    first = false;
                }
            };
        }
        flag!(is_readable, "READABLE");
        flag!(is_writable, "WRITABLE");
        flag!(is_error, "ERROR");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_and_query() {
        let i = Interest::READABLE | Interest::WRITABLE;
        assert!(i.is_readable());
        assert!(i.is_writable());
        assert!(!i.is_error());
    }

    #[test]
    fn remove() {
        let i = Interest::READABLE | Interest::WRITABLE;
        let r = i.remove(Interest::WRITABLE).unwrap();
        assert!(r.is_readable());
        assert!(!r.is_writable());
        assert!(i.remove(Interest::READABLE | Interest::WRITABLE).is_none());
    }
}
