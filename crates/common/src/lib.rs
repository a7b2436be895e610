// beacon-common: shared wire types for the beacon workspace

pub mod protocol;
