// Licensed under the Apache-2.0 license

mod test_commands;
mod test_dpe;
mod test_fw_load;
mod test_mailbox;
