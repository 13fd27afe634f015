// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

pub mod dispatcher;
pub mod error;
pub mod fd_stage;
pub mod frame;
pub mod frame_pool;
pub mod group;
pub mod hw_api;
pub mod hw_stage;
pub mod interrupt;
pub mod isp_stage;
pub mod notify;
pub mod registry;
pub mod scaler_stage;
pub mod setfile;
pub mod taa_stage;
