use serde::{Deserialize, Serialize};

use crate::common::{address::Address, word::Word};

/// One message call as the interpreter sees it.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Call {
    pub from: Address,
    pub to: Address,
    pub value: Word,
    pub data: Vec<u8>,
    pub gas: u64,
}
