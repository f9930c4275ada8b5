// Copyright 2023 Oxide Computer Company
