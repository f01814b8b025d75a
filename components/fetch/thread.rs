/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::io;
use std::thread;

/// Spawn a named thread. Callers decide what a refusal from the OS means
/// for the work they were about to hand off.
pub fn spawn_named<F>(name: String, f: F) -> io::Result<()>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new().name(name).spawn(f).map(|_| ())
}
