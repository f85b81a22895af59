//! Request/reply encoding of the mutation API for the capability invocation path.
//!
//! An invocation arrives as an opcode, a handful of data words and up to two capability arguments. It is
//! decoded into an [`Operation`], executed against a [`MemoryContext`] and answered with a [`Reply`] which can
//! be flattened back into status and data words.
//!
//! | Opcode | Number | Data arguments | Capability arguments | Reply |
//! |--------|:------:|----------------|----------------------|-------|
//! | [GetSlot](Opcode::GetSlot) | *1* | slot | | capability |
//! | [SetSlot](Opcode::SetSlot) | *2* | slot | capability | |
//! | [GuardedSetSlot](Opcode::GuardedSetSlot) | *3* | slot, encoded guard | capability | |
//! | [GetL2v](Opcode::GetL2v) | *4* | | | l2v |
//! | [SetL2v](Opcode::SetL2v) | *5* | l2v | | previous l2v |
//! | [GetHandler](Opcode::GetHandler) | *6* | | | 0 or 1 |
//! | [SetHandler](Opcode::SetHandler) | *7* | 0 or 1 | | previous setting |
//! | [Erase](Opcode::Erase) | *8* | | | |
//! | [CopyFrom](Opcode::CopyFrom) | *9* | | source GPT | invoked capability with the source's guard |
//! | [Fetch](Opcode::Fetch) | *10* | capability address | | capability |
//! | [Store](Opcode::Store) | *11* | capability address | capability | |
//! | [ExtendedFetch](Opcode::ExtendedFetch) | *12* | offset, l2 | | capability, l2v, restrictions |
//! | [ExtendedStore](Opcode::ExtendedStore) | *13* | offset, l2, encoded guard or 0 | capability | |
//! | [Destroy](Opcode::Destroy) | *14* | | | |

use crate::cap::Capability;
use crate::context::MemoryContext;
use crate::guard::Guard;
use crate::hwmap::tlb::TlbFlush;
use crate::ops::{ExtendedSlot, InvokeError};
use crate::store::Bank;

macro_rules! back_to_enum {
    ($(#[$meta:meta])* $vis:vis enum $name:ident {
        $($(#[$vmeta:meta])* $vname:ident $(= $val:expr)?,)*
    }) => {
        $(#[$meta])*
        $vis enum $name {
            $($(#[$vmeta])* $vname $(= $val)?,)*
        }

        impl core::convert::TryFrom<usize> for $name {
            type Error = InvokeError;

            fn try_from(v: usize) -> Result<Self, Self::Error> {
                match v {
                    $(x if x == $name::$vname as usize => Ok($name::$vname),)*
                    _ => Err(InvokeError::RequestError),
                }
            }
        }
    }
}

back_to_enum! {
    #[repr(usize)]
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub enum Opcode {
        GetSlot = 1,
        SetSlot = 2,
        GuardedSetSlot = 3,
        GetL2v = 4,
        SetL2v = 5,
        GetHandler = 6,
        SetHandler = 7,
        Erase = 8,
        CopyFrom = 9,
        Fetch = 10,
        Store = 11,
        ExtendedFetch = 12,
        ExtendedStore = 13,
        Destroy = 14,
    }
}

/// The data words of an invocation
pub type RawInvokeArgs = [u64; 3];

/// Status word followed by the data words of a reply
pub type RawInvokeReply = [u64; 4];

/// An invocation as delivered by the invocation path
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Request {
    pub opcode: usize,
    pub args: RawInvokeArgs,
    pub caps: [Capability; 2],
}

impl Request {
    pub fn new(opcode: Opcode, args: RawInvokeArgs) -> Self {
        Self {
            opcode: opcode as usize,
            args,
            caps: [Capability::NULL; 2],
        }
    }

    pub fn with_cap(mut self, cap: Capability) -> Self {
        self.caps[0] = cap;
        self
    }
}

/// A decoded mutation API call
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Operation {
    GetSlot { slot: usize },
    SetSlot { slot: usize, cap: Capability },
    GuardedSetSlot { slot: usize, cap: Capability, guard: Guard },
    GetL2v,
    SetL2v { l2v: u8 },
    GetHandler,
    SetHandler { has_handler: bool },
    Erase,
    CopyFrom { source: Capability },
    Fetch { addr: u64 },
    Store { addr: u64, cap: Capability },
    ExtendedFetch { offset: u64, l2arg: u8 },
    ExtendedStore {
        offset: u64,
        l2arg: u8,
        guard: Option<Guard>,
        cap: Capability,
    },
    Destroy,
}

fn small<V: TryFrom<u64>>(raw: u64) -> Result<V, InvokeError> {
    V::try_from(raw).map_err(|_| InvokeError::RequestError)
}

fn guard(raw: u64) -> Result<Guard, InvokeError> {
    Guard::decode(small(raw)?).map_err(|_| InvokeError::RequestError)
}

fn flag(raw: u64) -> Result<bool, InvokeError> {
    match raw {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(InvokeError::RequestError),
    }
}

impl TryFrom<&Request> for Operation {
    type Error = InvokeError;

    fn try_from(request: &Request) -> Result<Self, Self::Error> {
        let [a0, a1, a2] = request.args;
        let cap = request.caps[0];
        Ok(match Opcode::try_from(request.opcode)? {
            Opcode::GetSlot => Operation::GetSlot { slot: small(a0)? },
            Opcode::SetSlot => Operation::SetSlot {
                slot: small(a0)?,
                cap,
            },
            Opcode::GuardedSetSlot => Operation::GuardedSetSlot {
                slot: small(a0)?,
                cap,
                guard: guard(a1)?,
            },
            Opcode::GetL2v => Operation::GetL2v,
            Opcode::SetL2v => Operation::SetL2v { l2v: small(a0)? },
            Opcode::GetHandler => Operation::GetHandler,
            Opcode::SetHandler => Operation::SetHandler {
                has_handler: flag(a0)?,
            },
            Opcode::Erase => Operation::Erase,
            Opcode::CopyFrom => Operation::CopyFrom { source: cap },
            Opcode::Fetch => Operation::Fetch { addr: a0 },
            Opcode::Store => Operation::Store { addr: a0, cap },
            Opcode::ExtendedFetch => Operation::ExtendedFetch {
                offset: a0,
                l2arg: small(a1)?,
            },
            Opcode::ExtendedStore => Operation::ExtendedStore {
                offset: a0,
                l2arg: small(a1)?,
                // a zero l2g keeps the guard of the stored capability
                guard: match a2 {
                    0 => None,
                    raw => Some(guard(raw)?),
                },
                cap,
            },
            Opcode::Destroy => Operation::Destroy,
        })
    }
}

/// The successful outcome of an invocation
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Reply {
    Done,
    Value(u64),
    Cap(Capability),
    Extended(ExtendedSlot),
}

impl Reply {
    /// The capability carried by the reply, null if there is none
    pub fn cap(&self) -> Capability {
        match self {
            Reply::Cap(cap) => *cap,
            Reply::Extended(slot) => slot.cap,
            Reply::Done | Reply::Value(_) => Capability::NULL,
        }
    }
}

impl InvokeError {
    /// The status word reporting this error
    pub const fn code(self) -> u64 {
        match self {
            InvokeError::RequestError => 1,
            InvokeError::NoAccess => 2,
            InvokeError::OpaqueSpace => 3,
            InvokeError::CapAccessTypeError => 4,
            InvokeError::NoSuchSlot => 5,
            InvokeError::InvalidAddress => 6,
            InvokeError::MalformedSpace => 7,
            InvokeError::InvalidCapability => 8,
        }
    }
}

/// Flatten the outcome of an invocation into its status and data words.
///
/// A status of 0 means success. Capabilities are not part of the words and are delivered through
/// [`Reply::cap`].
pub fn encode_reply(result: &Result<Reply, InvokeError>) -> RawInvokeReply {
    match result {
        Ok(Reply::Done | Reply::Cap(_)) => [0, 0, 0, 0],
        Ok(Reply::Value(value)) => [0, *value, 0, 0],
        Ok(Reply::Extended(slot)) => [0, slot.l2v as u64, slot.restrictions.bits() as u64, 0],
        Err(e) => [e.code(), 0, 0, 0],
    }
}

impl<T: TlbFlush> MemoryContext<T> {
    /// Execute `operation` on the object `invoked` refers to
    pub fn execute(
        &self,
        bank: &impl Bank,
        invoked: Capability,
        operation: Operation,
    ) -> Result<Reply, InvokeError> {
        log::trace!("[invoke] {operation:?} on {invoked:?}");
        Ok(match operation {
            Operation::GetSlot { slot } => Reply::Cap(self.get_slot(invoked, slot)?),
            Operation::SetSlot { slot, cap } => {
                self.set_slot(invoked, slot, cap)?;
                Reply::Done
            }
            Operation::GuardedSetSlot { slot, cap, guard } => {
                self.guarded_set_slot(invoked, slot, cap, guard)?;
                Reply::Done
            }
            Operation::GetL2v => Reply::Value(self.get_l2v(invoked)? as u64),
            Operation::SetL2v { l2v } => Reply::Value(self.set_l2v(invoked, l2v)? as u64),
            Operation::GetHandler => Reply::Value(self.get_handler(invoked)? as u64),
            Operation::SetHandler { has_handler } => {
                Reply::Value(self.set_handler(invoked, has_handler)? as u64)
            }
            Operation::Erase => {
                self.erase(invoked)?;
                Reply::Done
            }
            Operation::CopyFrom { source } => Reply::Cap(self.copy_from(invoked, source)?),
            Operation::Fetch { addr } => Reply::Cap(self.fetch_cap(invoked, addr)?),
            Operation::Store { addr, cap } => {
                self.store_cap(invoked, addr, cap)?;
                Reply::Done
            }
            Operation::ExtendedFetch { offset, l2arg } => {
                Reply::Extended(self.extended_fetch(invoked, offset, l2arg)?)
            }
            Operation::ExtendedStore {
                offset,
                l2arg,
                guard,
                cap,
            } => {
                self.extended_store(invoked, offset, l2arg, guard, cap)?;
                Reply::Done
            }
            Operation::Destroy => {
                self.destroy(bank, invoked)?;
                Reply::Done
            }
        })
    }

    /// Decode and execute a raw invocation of `invoked`
    pub fn invoke(
        &self,
        bank: &impl Bank,
        invoked: Capability,
        request: &Request,
    ) -> Result<Reply, InvokeError> {
        let operation = Operation::try_from(request)?;
        self.execute(bank, invoked, operation)
    }
}
