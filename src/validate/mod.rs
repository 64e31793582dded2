/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Pure validation over a snapshot of the consensus state: block shape
//! checks in `block`, transaction checks in `transaction`. Nothing in this
//! module mutates anything.

pub mod block;
pub mod transaction;
