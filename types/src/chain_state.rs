use {
    crate::{
        block_id::BlockId,
        error::TypesError,
        validator::{Validator, ValidatorSet},
    },
    serde::{Deserialize, Serialize},
    solana_hash::Hash,
    solana_pubkey::Pubkey,
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisValidator {
    pub address: Pubkey,
    pub power: u64,
}

/// Initial conditions of a chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisDoc {
    pub chain_id: String,
    pub genesis_time_ms: u64,
    pub validators: Vec<GenesisValidator>,
    #[serde(default)]
    pub initial_state_root: Hash,
}

/// The state a node holds after committing `last_block_height`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainState {
    pub chain_id: String,
    pub last_block_height: u64,
    pub last_block_id: BlockId,
    pub last_block_time_ms: u64,
    pub last_block_total_txs: u64,
    /// Validators for `last_block_height + 1`.
    pub validators: ValidatorSet,
    /// Validators that signed the last block's commit.
    pub last_validators: ValidatorSet,
    pub state_root: Hash,
}

impl ChainState {
    pub fn from_genesis(genesis: &GenesisDoc) -> Result<Self, TypesError> {
        let validators = ValidatorSet::new(
            genesis
                .validators
                .iter()
                .map(|v| Validator::new(v.address, v.power))
                .collect(),
        )?;
        Ok(Self {
            chain_id: genesis.chain_id.clone(),
            last_block_height: 0,
            last_block_id: BlockId::default(),
            last_block_time_ms: genesis.genesis_time_ms,
            last_block_total_txs: 0,
            validators,
            last_validators: ValidatorSet::default(),
            state_root: genesis.initial_state_root,
        })
    }

    /// Height of the next block to decide.
    pub fn next_height(&self) -> u64 {
        self.last_block_height.saturating_add(1)
    }

    /// Re-derives lookup indices skipped during deserialization.
    pub fn rebuild_indices(&mut self) {
        self.validators.rebuild_index();
        self.last_validators.rebuild_index();
    }
}
